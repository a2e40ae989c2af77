//! flowlens-core: passive real-time flow and packet analyzer.
//!
//! Decodes captured link-layer frames into 5-tuple flows, maintains a
//! sliding window of per-flow totals plus multi-interval rate tables, tracks
//! TCP RTT/window/congestion state and RTP/H.264/H.265 video quality, and
//! publishes an immutable [`Snapshot`] for readers to poll lock-free.
//!
//! The writer side of the pipeline is a single pinned real-time thread
//! (§4.10/§4.11): [`Engine::start`] spawns it against a caller-supplied
//! [`CaptureSource`], and readers call [`Engine::snapshot`] from any other
//! thread without blocking the writer.

pub mod canonical;
pub mod decode;
pub mod engine;
pub mod error;
pub mod flow_key;
pub mod flow_table;
pub mod histogram;
pub mod interval;
pub mod platform;
pub mod ring;
pub mod snapshot;
pub mod tcp;
pub mod time;
pub mod video;

pub use canonical::{CanonicalAddrs, CanonicalKey};
pub use decode::{decode_frame, Decoded, LinkType};
pub use engine::{
    CaptureSource, Engine, EngineConfig, EngineStats, RawPacket, RtspHint,
    DEFAULT_INTERVAL_DURATIONS_US,
};
pub use error::{CaptureError, DecodeError, EngineError};
pub use flow_key::{FlowAddrs, FlowKey, L4Proto};
pub use snapshot::{
    ConnectionHealth, FlowSnapshot, IntervalRate, Snapshot, TcpSnapshot, VideoStreamSnapshot,
    TOP_N_FLOWS,
};
pub use tcp::{ConnState, RttTracker, TcpRttEntry, TcpSegment, WindowTracker};
pub use time::Timestamp;
pub use video::VideoObservation;
