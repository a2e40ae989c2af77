//! Engine lifecycle (§4.11, ambient): the public top-level object hosting
//! the pinned real-time writer thread described by §4.10's tick loop.
//!
//! Mirrors the teacher's `SrtOutputStream`/`AtomicOutputStats` shape: an
//! `Arc<AtomicXxx>` stats block shared lock-free with the writer thread, a
//! `running: Arc<AtomicBool>` flag `stop()` flips, and a `JoinHandle` kept
//! behind a coarse [`parking_lot::Mutex`] solely to serialize `start`/`stop`
//! against each other (§5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::decode::{self, LinkType};
use crate::error::{CaptureError, EngineError};
use crate::flow_key::FlowKey;
use crate::flow_table::SlidingWindowFlowTable;
use crate::histogram::{IpgHistogram, PacketSizeHistogram, PpsHistogram};
use crate::interval::IntervalBank;
use crate::platform;
use crate::snapshot::{self, Snapshot, SnapshotSources};
use crate::tcp::{self, RttTracker, WindowTracker};
use crate::time::Timestamp;
use crate::video::{self, Resolution, VideoMetricsTracker};

/// Default interval durations in microseconds (§6): 100ms, 200ms, 500ms,
/// 1s, 3s, 5s, 10s, 60s — shortest first, since index 0 feeds PPS
/// histograms and the "smallest interval" rotation rule (§4.4).
pub const DEFAULT_INTERVAL_DURATIONS_US: [i64; 8] = [
    100_000, 200_000, 500_000, 1_000_000, 3_000_000, 5_000_000, 10_000_000, 60_000_000,
];

const DEFAULT_SLIDING_WINDOW_US: i64 = 3_000_000;
const DEFAULT_RING_CAPACITY: usize = 8192;
const DEFAULT_MAX_PACKETS_PER_TICK: usize = 1000;
const TICK_INTERVAL_US: i64 = 1_000;

/// Construction-time configuration (§6, §17): sliding-window size, interval
/// list, ring capacity, RT priority/affinity. Taken as an already-built
/// struct — no file/env parsing lives in the core.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sliding_window_us: i64,
    pub interval_durations_us: Vec<i64>,
    pub ring_capacity: usize,
    pub max_packets_per_tick: usize,
    pub request_realtime_priority: bool,
    pub cpu_affinity: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sliding_window_us: DEFAULT_SLIDING_WINDOW_US,
            interval_durations_us: DEFAULT_INTERVAL_DURATIONS_US.to_vec(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_packets_per_tick: DEFAULT_MAX_PACKETS_PER_TICK,
            request_realtime_priority: true,
            cpu_affinity: None,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.sliding_window_us <= 0 {
            return Err(EngineError::NonPositiveWindow);
        }
        if self.interval_durations_us.is_empty() {
            return Err(EngineError::EmptyIntervalList);
        }
        if !self.ring_capacity.is_power_of_two() {
            return Err(EngineError::RingCapacityNotPowerOfTwo(self.ring_capacity));
        }
        Ok(())
    }
}

/// One captured frame, as delivered by the external capture driver (§6
/// inbound interface).
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub timestamp: Timestamp,
    pub original_len: u32,
    pub captured_len: u32,
    pub bytes: Vec<u8>,
    pub link_type: LinkType,
}

/// The capture driver's interface (§6): non-blocking, `Ok(None)` for
/// "nothing available right now", `Err(CaptureError::Closed)` is the
/// writer thread's one fatal condition.
pub trait CaptureSource: Send {
    fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError>;
}

/// Optional out-of-band codec-parameter overlay from an RTSP/SDP tap (§6).
/// Default is a no-op so a caller that never wires up a tap pays nothing.
pub trait RtspHint {
    fn update_codec_params(
        &self,
        flow: FlowKey,
        ssrc: u32,
        width: u32,
        height: u32,
        profile: u8,
        level: u8,
    ) {
        let _ = (flow, ssrc, width, height, profile, level);
    }
}

struct HintMessage {
    flow: FlowKey,
    ssrc: u32,
    width: u32,
    height: u32,
    profile: u8,
    level: u8,
}

/// Lock-free running counters for the §7 error taxonomy's packet-dropped
/// causes, shared between the writer thread and any reader (teacher's
/// `AtomicOutputStats` shape).
#[derive(Default)]
struct AtomicEngineStats {
    decode_ignored: AtomicU64,
    decode_malformed: AtomicU64,
    decode_unsupported: AtomicU64,
    ring_overwrites: AtomicU64,
    alloc_failures: AtomicU64,
}

impl AtomicEngineStats {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            decode_ignored: self.decode_ignored.load(Ordering::Relaxed),
            decode_malformed: self.decode_malformed.load(Ordering::Relaxed),
            decode_unsupported: self.decode_unsupported.load(Ordering::Relaxed),
            ring_overwrites: self.ring_overwrites.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the engine's error-taxonomy counters (§3).
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub decode_ignored: u64,
    pub decode_malformed: u64,
    pub decode_unsupported: u64,
    pub ring_overwrites: u64,
    pub alloc_failures: u64,
}

/// The engine: owns construction, `start`/`stop`/`join`, and exposes
/// `snapshot()`/`stats()` for readers (§4.11).
pub struct Engine<C: CaptureSource + 'static> {
    config: EngineConfig,
    capture: Mutex<Option<C>>,
    running: Arc<AtomicBool>,
    snapshot: Arc<ArcSwap<Snapshot>>,
    stats: Arc<AtomicEngineStats>,
    hint_tx: mpsc::Sender<HintMessage>,
    hint_rx: Mutex<Option<mpsc::Receiver<HintMessage>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<C: CaptureSource + 'static> Engine<C> {
    pub fn new(config: EngineConfig, capture: C) -> Result<Self, EngineError> {
        config.validate()?;
        let (hint_tx, hint_rx) = mpsc::channel();
        let initial = Snapshot::empty(Timestamp::new(0, 0), config.interval_durations_us.clone());
        Ok(Self {
            config,
            capture: Mutex::new(Some(capture)),
            running: Arc::new(AtomicBool::new(false)),
            snapshot: Arc::new(ArcSwap::new(Arc::new(initial))),
            stats: Arc::new(AtomicEngineStats::default()),
            hint_tx,
            hint_rx: Mutex::new(Some(hint_rx)),
            thread: Mutex::new(None),
        })
    }

    /// The most recently published snapshot. Lock-free: an atomic pointer
    /// load plus a refcount bump (§5).
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the writer thread and begin the tick loop. Returns an error
    /// if the engine was already started (or already torn down) once.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut capture_slot = self.capture.lock();
        let capture = capture_slot.take().ok_or(EngineError::AlreadyStarted)?;
        drop(capture_slot);

        let hint_rx = self
            .hint_rx
            .lock()
            .take()
            .expect("hint receiver taken exactly once, at start()");

        self.running.store(true, Ordering::Release);

        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let snapshot = Arc::clone(&self.snapshot);
        let stats = Arc::clone(&self.stats);

        let handle = std::thread::Builder::new()
            .name("flowlens-writer".to_string())
            .spawn(move || {
                writer_loop(config, capture, hint_rx, running, snapshot, stats);
            })
            .expect("failed to spawn flowlens writer thread");

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Signal the writer thread to exit at the top of its next tick and
    /// block until it does.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<C: CaptureSource + 'static> RtspHint for Engine<C> {
    fn update_codec_params(
        &self,
        flow: FlowKey,
        ssrc: u32,
        width: u32,
        height: u32,
        profile: u8,
        level: u8,
    ) {
        let _ = self.hint_tx.send(HintMessage {
            flow,
            ssrc,
            width,
            height,
            profile,
            level,
        });
    }
}

/// All single-writer state the tick loop owns exclusively (§5 ownership
/// rule): hash tables, the ring, per-flow histograms.
struct WriterState {
    flow_table: SlidingWindowFlowTable,
    interval_bank: IntervalBank,
    rtt: RttTracker,
    window: WindowTracker,
    video: VideoMetricsTracker,
    ipg: HashMap<FlowKey, IpgHistogram>,
    pkt_size: HashMap<FlowKey, PacketSizeHistogram>,
    pps: HashMap<FlowKey, PpsHistogram>,
    sliding_window_us: i64,
}

impl WriterState {
    fn new(config: &EngineConfig, start: Timestamp) -> Self {
        Self {
            flow_table: SlidingWindowFlowTable::new(config.ring_capacity, config.sliding_window_us)
                .expect("ring capacity validated as a power of two at construction"),
            interval_bank: IntervalBank::new(&config.interval_durations_us, start),
            rtt: RttTracker::new(),
            window: WindowTracker::new(),
            video: VideoMetricsTracker::new(),
            ipg: HashMap::new(),
            pkt_size: HashMap::new(),
            pps: HashMap::new(),
            sliding_window_us: config.sliding_window_us,
        }
    }

    fn apply_hint(&mut self, hint: HintMessage) {
        if let Some(entry) = self.video.get_mut(&hint.flow, hint.ssrc) {
            entry.apply_sdp_hint(
                Resolution {
                    width: hint.width,
                    height: hint.height,
                },
                hint.profile,
                hint.level,
            );
        }
    }

    /// One captured frame through decode (§4.1) → ring/totals (§4.3) →
    /// interval accumulation (§4.4) → per-flow histograms (§4.5) → TCP
    /// (§4.6/§4.7) or video (§4.9) updates, per §4.10 step 4.
    fn ingest(&mut self, pkt: &RawPacket, stats: &AtomicEngineStats) {
        let decoded = match decode::decode_frame(pkt.link_type, &pkt.bytes) {
            Ok(d) => d,
            Err(crate::error::DecodeError::Ignored(_)) => {
                stats.decode_ignored.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(crate::error::DecodeError::Malformed(_)) => {
                stats.decode_malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(crate::error::DecodeError::Unsupported(_)) => {
                stats.decode_unsupported.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let key = decoded.key;
        let bytes = pkt.original_len as i64;

        let overwrites_before = self.flow_table.ring_overwrites();
        self.flow_table.record_packet(key, bytes, pkt.timestamp);
        let new_overwrites = self.flow_table.ring_overwrites() - overwrites_before;
        if new_overwrites > 0 {
            stats.ring_overwrites.fetch_add(new_overwrites, Ordering::Relaxed);
        }

        self.interval_bank.add_packet(key, bytes);
        self.ipg.entry(key).or_default().record(pkt.timestamp);
        self.pkt_size
            .entry(key)
            .or_default()
            .record(pkt.bytes.len() as u32);

        if key.l4_proto == crate::flow_key::L4Proto::Tcp {
            self.ingest_tcp(&pkt.bytes, &decoded, pkt.timestamp);
        } else if key.l4_proto == crate::flow_key::L4Proto::Udp {
            let payload = pkt.bytes.get(decoded.l4_offset..).unwrap_or(&[]);
            self.ingest_udp_payload(key, payload, pkt.timestamp);
        }
    }

    fn ingest_tcp(&mut self, frame: &[u8], decoded: &decode::Decoded, now: Timestamp) {
        let Some(seg) = tcp::parse_segment(frame, decoded.l4_header_offset, decoded.l4_offset) else {
            return;
        };
        let (canonical_key, forward) = crate::canonical::canonicalize(&decoded.key);
        self.rtt.record(canonical_key, forward, now, &seg);
        self.window.record(canonical_key, forward, now, &seg);

        let reverse_key = decoded.key.reversed();
        let window_entry = self.window.get(&canonical_key);
        let scaled_window = window_entry.map(|w| w.scaled_window(forward));
        let events = window_entry.map(|w| w.recent_events(forward)).unwrap_or(0);
        self.interval_bank
            .fold_tcp_observation(reverse_key, scaled_window, events);
    }

    fn ingest_udp_payload(&mut self, key: FlowKey, payload: &[u8], now: Timestamp) {
        if video::observe_rtp_packet(&mut self.video, key, payload, now).is_some() {
            return;
        }
        let _ = video::detect_mpegts(payload);
    }

    /// Expire everything that has aged out of the sliding window, plus any
    /// TCP/video entries whose last activity predates it (§4.14 Expiry).
    fn expire(&mut self, deadline: Timestamp) {
        self.flow_table.expire_older_than(deadline);
        let cutoff = deadline.add_micros(-self.flow_table_window_us());
        self.rtt.expire_before(cutoff);
        self.window.expire_before(cutoff);
        self.video.expire_before(cutoff);
        #[cfg(debug_assertions)]
        self.flow_table.assert_invariants();
    }

    fn flow_table_window_us(&self) -> i64 {
        self.sliding_window_us
    }

    fn rotate_intervals(&mut self, now: Timestamp) {
        let window = &self.window;
        let lifetime_max_window = |key: &FlowKey| {
            let (canonical_key, forward) = crate::canonical::canonicalize(key);
            window
                .get(&canonical_key)
                .map(|w| w.max_window(forward))
                .unwrap_or(0)
        };
        let pps_input = self.interval_bank.rotate_due(now, lifetime_max_window);
        for (key, packets) in pps_input {
            self.pps
                .entry(key)
                .or_default()
                .record(packets.max(0) as u32);
        }

        // Every interval record still open at this point has already folded
        // in whatever events `ingest_tcp` set on the window tracker since
        // the last clear (`fold_tcp_observation` runs per-packet, earlier
        // in each tick, before this rotation). Clear the source now so the
        // next packet's fold starts from zero instead of re-injecting the
        // same old events into freshly rotated records forever (§4.10
        // step 4).
        self.window.clear_all_recent_events();
    }
}

/// The writer thread body (§4.10): compute the next absolute deadline,
/// build and publish the snapshot, drain a bounded batch of packets, sleep
/// until the deadline, repeat. Exits cleanly on `CaptureError::Closed` or
/// when `running` is cleared by [`Engine::stop`].
fn writer_loop<C: CaptureSource>(
    config: EngineConfig,
    mut capture: C,
    hint_rx: mpsc::Receiver<HintMessage>,
    running: Arc<AtomicBool>,
    published: Arc<ArcSwap<Snapshot>>,
    stats: Arc<AtomicEngineStats>,
) {
    if config.request_realtime_priority {
        platform::request_realtime_priority();
    }
    if let Some(core) = config.cpu_affinity {
        platform::pin_to_core(core);
    }

    let start = now_from_wall_clock();
    let mut state = WriterState::new(&config, start);
    let mut deadline = start.add_micros(TICK_INTERVAL_US);

    while running.load(Ordering::Acquire) {
        while let Ok(hint) = hint_rx.try_recv() {
            state.apply_hint(hint);
        }

        state.expire(deadline);
        state.rotate_intervals(deadline);

        let sources = SnapshotSources {
            flow_table: &state.flow_table,
            interval_bank: &state.interval_bank,
            rtt: &state.rtt,
            window: &state.window,
            video: &state.video,
            ipg: &state.ipg,
            pkt_size: &state.pkt_size,
        };
        let snap = snapshot::build(deadline, &sources);
        published.store(Arc::new(snap));

        let mut drained = 0usize;
        while drained < config.max_packets_per_tick {
            match capture.next_packet() {
                Ok(Some(pkt)) => {
                    state.ingest(&pkt, &stats);
                    drained += 1;
                }
                Ok(None) => break,
                Err(CaptureError::Closed) => {
                    running.store(false, Ordering::Release);
                    return;
                }
                Err(CaptureError::Io(reason)) => {
                    log::warn!("capture source error: {reason}");
                    break;
                }
            }
        }

        sleep_until(deadline);
        deadline = deadline.add_micros(TICK_INTERVAL_US);
    }
}

/// Wall-clock seed for the first tick's deadline. Subsequent deadlines are
/// derived purely by adding `TICK_INTERVAL_US`, never re-read from the
/// clock, so the loop can't accumulate drift from repeated `now()` calls.
fn now_from_wall_clock() -> Timestamp {
    let wall = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp::new(wall.as_secs() as i64, wall.subsec_micros() as i64)
}

fn sleep_until(deadline: Timestamp) {
    let delta_us = deadline.diff_micros(now_from_wall_clock());
    if delta_us > 0 {
        std::thread::sleep(Duration::from_micros(delta_us as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ScriptedCapture {
        packets: StdMutex<Vec<RawPacket>>,
        closed_after_empty: bool,
    }

    impl CaptureSource for ScriptedCapture {
        fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
            let mut packets = self.packets.lock().unwrap();
            if let Some(pkt) = packets.pop() {
                return Ok(Some(pkt));
            }
            if self.closed_after_empty {
                return Err(CaptureError::Closed);
            }
            Ok(None)
        }
    }

    #[test]
    fn config_validation_rejects_non_power_of_two_ring() {
        let config = EngineConfig {
            ring_capacity: 100,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_empty_intervals() {
        let config = EngineConfig {
            interval_durations_us: vec![],
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn engine_starts_and_stops_against_a_closed_capture_source() {
        let capture = ScriptedCapture {
            packets: StdMutex::new(Vec::new()),
            closed_after_empty: true,
        };
        let engine = Engine::new(EngineConfig::default(), capture).unwrap();
        engine.start().unwrap();
        // The capture source reports Closed on its very first poll, so the
        // writer thread exits on its own; stop() just joins it.
        std::thread::sleep(Duration::from_millis(20));
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn double_start_is_rejected() {
        let capture = ScriptedCapture {
            packets: StdMutex::new(Vec::new()),
            closed_after_empty: true,
        };
        let engine = Engine::new(EngineConfig::default(), capture).unwrap();
        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.stop();
    }
}
