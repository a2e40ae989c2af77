//! Error taxonomy (§7).
//!
//! Decode errors never propagate past the packet that triggered them — the
//! tick loop counts them and moves on (§7's "local to the packet or the
//! tick" propagation policy). `EngineError` is the only kind that can
//! actually fail an operation the caller observes, and only at
//! construction time.

use thiserror::Error;

/// Why a frame was dropped before it could update any table.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Recognized but deliberately not tracked (ARP, LLDP, ...).
    #[error("ignored frame: {0}")]
    Ignored(&'static str),
    /// Truncated or structurally invalid header.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    /// Understood enough to know we don't decode it further.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Construction-time configuration failures (§7 has no per-packet error
/// kind that escapes the writer thread; this is the one surface that can).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("packet ring capacity {0} is not a power of two")]
    RingCapacityNotPowerOfTwo(usize),
    #[error("interval list must not be empty")]
    EmptyIntervalList,
    #[error("sliding window size must be positive")]
    NonPositiveWindow,
    #[error("engine already started")]
    AlreadyStarted,
}

/// A capture source's only error surface (§6): anything that isn't
/// "no packet available right now" (`Ok(None)`). `Closed` is the writer
/// thread's one fatal condition — it exits the tick loop cleanly (§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture source closed")]
    Closed,
    #[error("capture source error: {0}")]
    Io(String),
}
