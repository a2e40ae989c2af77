//! The immutable per-tick publication object (§3 `Snapshot`, §4.10 step 2,
//! §6 outbound interface): top-`K` flows by bytes descending, each carrying
//! a per-interval rate plus sticky TCP/window/video metrics.
//!
//! Built fresh into the non-published buffer every tick and handed to
//! [`crate::engine::Engine`] for an `ArcSwap::store` — see §5's
//! lock-free-reader redesign note in `SPEC_FULL.md`.

use crate::canonical::canonicalize;
use crate::flow_key::FlowKey;
use crate::flow_table::SlidingWindowFlowTable;
use crate::histogram::{IpgHistogram, PacketSizeHistogram};
use crate::interval::IntervalBank;
use crate::tcp::{ConnState, RttTracker, WindowTracker};
use crate::time::Timestamp;
use crate::video::{CodecKind, Resolution, VideoMetricsTracker};

/// Compile-time cap on ranked flows per snapshot (§6: "K is compile-time
/// fixed (e.g. 20)").
pub const TOP_N_FLOWS: usize = 20;

/// Sentinel for an RTT that has no sample yet, mirrored from
/// [`crate::tcp::rtt::RTT_UNAVAILABLE`] so readers never need that module.
pub const RTT_UNAVAILABLE: i64 = crate::tcp::rtt::RTT_UNAVAILABLE;

/// One interval index's rate view of one flow (§4.4, §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalRate {
    pub duration_us: i64,
    pub bytes_per_s: i64,
    pub packets_per_s: i64,
    pub window_min: Option<u32>,
    pub window_max: Option<u32>,
    pub conditions: u8,
    pub recent_events: u8,
}

/// A coarse transport-health classification derived from connection state
/// and the most recent window conditions, for consumers that just want a
/// single glanceable field rather than every counter (§3 `health`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Unknown,
    Healthy,
    Congested,
    Starving,
}

/// Live TCP RTT/window fields for one connection, both directions relative
/// to this flow's own orientation (§4.6, §4.7).
#[derive(Debug, Clone, Copy)]
pub struct TcpSnapshot {
    pub state: ConnState,
    pub rtt_ewma_us: i64,
    pub rtt_ewma_us_reverse: i64,
    pub rtt_sample_count: u64,
    pub scaled_window: u32,
    pub scaled_window_reverse: u32,
    pub zero_window_count: u64,
    pub dup_ack_count: u64,
    pub retransmit_count: u64,
    pub health: ConnectionHealth,
}

/// One live `(Flow, SSRC)` RTP stream's metrics, as last observed (§4.9).
#[derive(Debug, Clone, Copy)]
pub struct VideoStreamSnapshot {
    pub ssrc: u32,
    pub codec: Option<CodecKind>,
    pub resolution: Option<Resolution>,
    pub jitter_us: i64,
    pub loss_count: u64,
    pub reorder_count: u64,
    pub discontinuity_count: u64,
    pub keyframe_count: u64,
    pub last_gop_size: u64,
    pub fps_x100: i64,
    pub bitrate_kbps: i64,
}

/// One ranked flow's complete published view.
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub total_bytes: i64,
    pub total_packets: i64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    /// Rate/window view per configured interval duration, same order as
    /// `Snapshot::interval_durations_us`.
    pub rates: Vec<IntervalRate>,
    pub ipg_mean_us: Option<i64>,
    pub pkt_size_mean: Option<f64>,
    pub pkt_size_variance: Option<f64>,
    pub tcp: Option<TcpSnapshot>,
    pub video: Vec<VideoStreamSnapshot>,
}

/// The full tick publication (§3, §6).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timestamp: Timestamp,
    pub flow_count: usize,
    pub total_bytes_per_s: i64,
    pub total_packets_per_s: i64,
    pub interval_durations_us: Vec<i64>,
    pub flows: Vec<FlowSnapshot>,
}

impl Snapshot {
    /// An empty snapshot, used as the `ArcSwap` initial value before the
    /// first tick completes (§5).
    pub fn empty(timestamp: Timestamp, interval_durations_us: Vec<i64>) -> Self {
        Self {
            timestamp,
            flow_count: 0,
            total_bytes_per_s: 0,
            total_packets_per_s: 0,
            interval_durations_us,
            flows: Vec::new(),
        }
    }
}

fn classify_health(state: ConnState, conditions: u8, retransmit_count: u64) -> ConnectionHealth {
    use crate::interval::window_condition;
    if state == ConnState::Unknown || state == ConnState::Closed {
        return ConnectionHealth::Unknown;
    }
    if conditions & window_condition::STARVING != 0 {
        return ConnectionHealth::Starving;
    }
    if conditions & (window_condition::ZERO_SEEN | window_condition::LOW) != 0 || retransmit_count > 0
    {
        return ConnectionHealth::Congested;
    }
    ConnectionHealth::Healthy
}

/// Everything the builder needs a read-only view of to assemble one tick's
/// snapshot; bundled so `build()` doesn't take a dozen positional args.
pub struct SnapshotSources<'a> {
    pub flow_table: &'a SlidingWindowFlowTable,
    pub interval_bank: &'a IntervalBank,
    pub rtt: &'a RttTracker,
    pub window: &'a WindowTracker,
    pub video: &'a VideoMetricsTracker,
    pub ipg: &'a std::collections::HashMap<FlowKey, IpgHistogram>,
    pub pkt_size: &'a std::collections::HashMap<FlowKey, PacketSizeHistogram>,
}

/// Build one tick's snapshot (§4.10 step 2): rank the sliding-window flow
/// table by bytes descending, take the top [`TOP_N_FLOWS`], and attach each
/// flow's per-interval rate plus sticky TCP/video fields.
pub fn build(now: Timestamp, sources: &SnapshotSources<'_>) -> Snapshot {
    let totals = sources.flow_table.totals();
    let interval_durations_us: Vec<i64> = sources
        .interval_bank
        .tables
        .iter()
        .map(|t| t.duration_us)
        .collect();

    let mut ranked: Vec<(&FlowKey, i64, i64, Timestamp, Timestamp)> = sources
        .flow_table
        .iter()
        .map(|(k, r)| (k, r.bytes, r.packets, r.first_seen, r.last_seen))
        .collect();
    ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(TOP_N_FLOWS);

    let flows = ranked
        .into_iter()
        .map(|(key, bytes, packets, first_seen, last_seen)| {
            build_flow_snapshot(*key, bytes, packets, first_seen, last_seen, sources)
        })
        .collect();

    let shortest_duration_us = interval_durations_us.first().copied().unwrap_or(1).max(1);
    Snapshot {
        timestamp: now,
        flow_count: sources.flow_table.flow_count(),
        total_bytes_per_s: totals.bytes * 1_000_000 / shortest_duration_us,
        total_packets_per_s: totals.packets * 1_000_000 / shortest_duration_us,
        interval_durations_us,
        flows,
    }
}

fn build_flow_snapshot(
    key: FlowKey,
    total_bytes: i64,
    total_packets: i64,
    first_seen: Timestamp,
    last_seen: Timestamp,
    sources: &SnapshotSources<'_>,
) -> FlowSnapshot {
    let rates = sources
        .interval_bank
        .tables
        .iter()
        .map(|table| {
            let rec = table.complete.records.get(&key);
            let duration_us = table.duration_us.max(1);
            match rec {
                Some(rec) => IntervalRate {
                    duration_us: table.duration_us,
                    bytes_per_s: rec.bytes * 1_000_000 / duration_us,
                    packets_per_s: rec.packets * 1_000_000 / duration_us,
                    window_min: (rec.window.samples > 0).then_some(rec.window.min),
                    window_max: (rec.window.samples > 0).then_some(rec.window.max),
                    conditions: rec.conditions,
                    recent_events: rec.recent_events,
                },
                None => IntervalRate {
                    duration_us: table.duration_us,
                    ..Default::default()
                },
            }
        })
        .collect();

    let (canonical_key, forward) = canonicalize(&key);
    let tcp = sources.rtt.get(&canonical_key).map(|rtt_entry| {
        let window_entry = sources.window.get(&canonical_key);
        let conditions = sources
            .interval_bank
            .shortest()
            .complete
            .records
            .get(&key)
            .map(|r| r.conditions)
            .unwrap_or(0);
        let retransmit_count = window_entry.map(|w| w.retransmit_count(forward)).unwrap_or(0);
        TcpSnapshot {
            state: rtt_entry.state,
            rtt_ewma_us: rtt_entry.ewma_us(forward),
            rtt_ewma_us_reverse: rtt_entry.ewma_us(!forward),
            rtt_sample_count: rtt_entry.sample_count(forward),
            scaled_window: window_entry.map(|w| w.scaled_window(forward)).unwrap_or(0),
            scaled_window_reverse: window_entry.map(|w| w.scaled_window(!forward)).unwrap_or(0),
            zero_window_count: window_entry.map(|w| w.zero_window_count(forward)).unwrap_or(0),
            dup_ack_count: window_entry.map(|w| w.dup_ack_count(forward)).unwrap_or(0),
            retransmit_count,
            health: classify_health(rtt_entry.state, conditions, retransmit_count),
        }
    });

    let video = sources
        .video
        .streams_for(&key)
        .map(|stream| VideoStreamSnapshot {
            ssrc: stream.ssrc,
            codec: stream.codec(),
            resolution: stream.resolution(),
            jitter_us: stream.jitter_us(),
            loss_count: stream.loss_count,
            reorder_count: stream.reorder_count,
            discontinuity_count: stream.discontinuity_count,
            keyframe_count: stream.keyframe_count,
            last_gop_size: stream.last_gop_size,
            fps_x100: stream.last_window.fps_x100,
            bitrate_kbps: stream.last_window.bitrate_kbps,
        })
        .collect();

    FlowSnapshot {
        key,
        total_bytes,
        total_packets,
        first_seen,
        last_seen,
        rates,
        ipg_mean_us: sources.ipg.get(&key).and_then(|h| h.mean_us()),
        pkt_size_mean: sources.pkt_size.get(&key).and_then(|h| h.mean()),
        pkt_size_variance: sources.pkt_size.get(&key).and_then(|h| h.variance()),
        tcp,
        video,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_key::{FlowAddrs, L4Proto};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn key(port: u16) -> FlowKey {
        FlowKey {
            addrs: FlowAddrs::V4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
            },
            src_port: port,
            dst_port: 80,
            l4_proto: L4Proto::Tcp,
            traffic_class: 0,
        }
    }

    fn sources_for<'a>(
        flow_table: &'a SlidingWindowFlowTable,
        interval_bank: &'a IntervalBank,
        rtt: &'a RttTracker,
        window: &'a WindowTracker,
        video: &'a VideoMetricsTracker,
        ipg: &'a HashMap<FlowKey, IpgHistogram>,
        pkt_size: &'a HashMap<FlowKey, PacketSizeHistogram>,
    ) -> SnapshotSources<'a> {
        SnapshotSources {
            flow_table,
            interval_bank,
            rtt,
            window,
            video,
            ipg,
            pkt_size,
        }
    }

    #[test]
    fn empty_inputs_produce_empty_snapshot() {
        let flow_table = SlidingWindowFlowTable::new(8, 3_000_000).unwrap();
        let interval_bank = IntervalBank::new(&[1_000_000], Timestamp::new(0, 0));
        let rtt = RttTracker::new();
        let window = WindowTracker::new();
        let video = VideoMetricsTracker::new();
        let ipg = HashMap::new();
        let pkt_size = HashMap::new();
        let sources = sources_for(&flow_table, &interval_bank, &rtt, &window, &video, &ipg, &pkt_size);
        let snap = build(Timestamp::new(1, 0), &sources);
        assert_eq!(snap.flow_count, 0);
        assert!(snap.flows.is_empty());
        assert_eq!(snap.total_bytes_per_s, 0);
    }

    #[test]
    fn ranks_flows_by_bytes_descending_and_caps_at_top_n() {
        let mut flow_table = SlidingWindowFlowTable::new(64, 3_000_000).unwrap();
        for i in 0..(TOP_N_FLOWS as u16 + 5) {
            flow_table.record_packet(key(i), 10 + i as i64, Timestamp::new(0, 0));
        }
        let interval_bank = IntervalBank::new(&[1_000_000], Timestamp::new(0, 0));
        let rtt = RttTracker::new();
        let window = WindowTracker::new();
        let video = VideoMetricsTracker::new();
        let ipg = HashMap::new();
        let pkt_size = HashMap::new();
        let sources = sources_for(&flow_table, &interval_bank, &rtt, &window, &video, &ipg, &pkt_size);
        let snap = build(Timestamp::new(0, 1), &sources);

        assert_eq!(snap.flows.len(), TOP_N_FLOWS);
        // Highest port carries the highest byte count in this fixture.
        assert!(snap.flows[0].total_bytes >= snap.flows[1].total_bytes);
        assert!(snap.flows.windows(2).all(|w| w[0].total_bytes >= w[1].total_bytes));
    }

    #[test]
    fn interval_rate_is_zero_when_no_complete_slot_yet() {
        let mut flow_table = SlidingWindowFlowTable::new(8, 3_000_000).unwrap();
        flow_table.record_packet(key(1), 100, Timestamp::new(0, 0));
        let interval_bank = IntervalBank::new(&[1_000_000], Timestamp::new(0, 0));
        let rtt = RttTracker::new();
        let window = WindowTracker::new();
        let video = VideoMetricsTracker::new();
        let ipg = HashMap::new();
        let pkt_size = HashMap::new();
        let sources = sources_for(&flow_table, &interval_bank, &rtt, &window, &video, &ipg, &pkt_size);
        let snap = build(Timestamp::new(0, 1), &sources);
        assert_eq!(snap.flows[0].rates[0].bytes_per_s, 0);
    }
}
