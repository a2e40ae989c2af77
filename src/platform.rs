//! Real-time thread priority and CPU affinity for the writer thread
//! (§4.10, §7 Capability/RealTime). Both are best-effort: a failure is
//! logged once and the thread continues at normal scheduling, never an
//! error the caller has to handle.

/// Request SCHED_FIFO at the given priority on Unix, `THREAD_PRIORITY_TIME_CRITICAL`
/// on Windows. Call once from the thread that should run real-time.
pub fn request_realtime_priority() {
    #[cfg(unix)]
    unix::set_fifo_priority();
    #[cfg(windows)]
    windows::set_time_critical_priority();
    #[cfg(not(any(unix, windows)))]
    log::warn!("real-time priority requested on an unsupported platform; continuing at normal scheduling");
}

/// Pin the calling thread to a single CPU core. `core_id` is a 0-based
/// index; an out-of-range value is rejected by the underlying syscall and
/// handled the same as any other affinity failure.
pub fn pin_to_core(core_id: usize) {
    #[cfg(unix)]
    unix::set_affinity(core_id);
    #[cfg(windows)]
    windows::set_affinity(core_id);
    #[cfg(not(any(unix, windows)))]
    {
        let _ = core_id;
        log::warn!("cpu affinity requested on an unsupported platform; continuing unpinned");
    }
}

#[cfg(unix)]
mod unix {
    /// Middle of Linux's realtime range — high enough to preempt normal
    /// scheduling, not so high it starves kernel housekeeping threads.
    const SCHED_FIFO_PRIORITY: i32 = 50;

    pub fn set_fifo_priority() {
        unsafe {
            let param = libc::sched_param {
                sched_priority: SCHED_FIFO_PRIORITY,
            };
            let rc = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
            if rc != 0 {
                log::warn!(
                    "SCHED_FIFO request failed (errno {}); continuing at normal scheduling",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    pub fn set_affinity(core_id: usize) {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core_id, &mut set);
            let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
            if rc != 0 {
                log::warn!(
                    "cpu affinity request for core {core_id} failed (errno {}); continuing unpinned",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadAffinityMask, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };

    pub fn set_time_critical_priority() {
        unsafe {
            let ok = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL);
            if ok == 0 {
                log::warn!(
                    "SetThreadPriority(TIME_CRITICAL) failed ({}); continuing at normal priority",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    pub fn set_affinity(core_id: usize) {
        unsafe {
            let mask: usize = 1usize << core_id;
            let prev = SetThreadAffinityMask(GetCurrentThread(), mask);
            if prev == 0 {
                log::warn!(
                    "SetThreadAffinityMask(core {core_id}) failed ({}); continuing unpinned",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}
