//! Per-connection, per-direction RTT tracking via outstanding-sequence
//! matching (§4.6).

use std::collections::{HashMap, VecDeque};

use crate::canonical::CanonicalKey;
use crate::time::{log_scale_bucket_14, Timestamp};

use super::{ConnState, TcpSegment};

/// Bound on the outstanding-sequence ring per direction. Past this many
/// unacked segments the oldest is dropped — it will simply never produce
/// an RTT sample, which only costs precision, not correctness.
const OUTSTANDING_CAPACITY: usize = 64;

/// Sentinel RTT value for "no sample yet" (§7 Lookup/NotFound).
pub const RTT_UNAVAILABLE: i64 = -1;

#[derive(Debug, Clone)]
struct DirectionRtt {
    outstanding: VecDeque<(u32, Timestamp)>,
    ewma_us: i64,
    last_us: i64,
    sample_count: u64,
    rtt_hist: [u32; 14],
}

impl Default for DirectionRtt {
    fn default() -> Self {
        Self {
            outstanding: VecDeque::new(),
            ewma_us: RTT_UNAVAILABLE,
            last_us: RTT_UNAVAILABLE,
            sample_count: 0,
            rtt_hist: [0; 14],
        }
    }
}

impl DirectionRtt {
    fn push_outstanding(&mut self, seq_end: u32, now: Timestamp) {
        if self.outstanding.len() == OUTSTANDING_CAPACITY {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back((seq_end, now));
    }

    /// Scan for entries covered by `ack` using wrap-aware signed 32-bit
    /// comparison; remove all covered entries and sample RTT from the
    /// last (most-recently-sent) match — the tightest bound for a
    /// cumulative ACK (§4.6).
    fn on_ack(&mut self, ack: u32, now: Timestamp) {
        let mut last_match: Option<Timestamp> = None;
        self.outstanding.retain(|&(seq_end, sent_at)| {
            let covered = (ack.wrapping_sub(seq_end) as i32) >= 0;
            if covered {
                last_match = Some(sent_at);
            }
            !covered
        });
        if let Some(sent_at) = last_match {
            let sample_us = now.diff_micros(sent_at).max(0);
            self.record_sample(sample_us);
        }
    }

    fn record_sample(&mut self, sample_us: i64) {
        self.ewma_us = if self.sample_count == 0 {
            sample_us
        } else {
            self.ewma_us + ((sample_us - self.ewma_us) >> 3)
        };
        self.last_us = sample_us;
        self.sample_count += 1;
        self.rtt_hist[log_scale_bucket_14(sample_us)] += 1;
    }
}

/// Bidirectional RTT state for one connection (§3 `TcpRttEntry`).
#[derive(Debug, Clone)]
pub struct TcpRttEntry {
    fwd: DirectionRtt,
    rev: DirectionRtt,
    pub state: ConnState,
    pub last_activity: Timestamp,
}

impl TcpRttEntry {
    fn new(now: Timestamp) -> Self {
        Self {
            fwd: DirectionRtt::default(),
            rev: DirectionRtt::default(),
            state: ConnState::Unknown,
            last_activity: now,
        }
    }

    /// EWMA RTT in microseconds for the direction the query asks about,
    /// or `RTT_UNAVAILABLE` if no sample has landed yet.
    pub fn ewma_us(&self, forward: bool) -> i64 {
        if forward {
            self.fwd.ewma_us
        } else {
            self.rev.ewma_us
        }
    }

    pub fn sample_count(&self, forward: bool) -> u64 {
        if forward {
            self.fwd.sample_count
        } else {
            self.rev.sample_count
        }
    }

    pub fn histogram(&self, forward: bool) -> &[u32; 14] {
        if forward {
            &self.fwd.rtt_hist
        } else {
            &self.rev.rtt_hist
        }
    }
}

/// Owns every live connection's RTT state, keyed by `CanonicalKey`.
#[derive(Debug, Default)]
pub struct RttTracker {
    entries: HashMap<CanonicalKey, TcpRttEntry>,
}

impl RttTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&TcpRttEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove entries whose `last_activity` has fallen outside the
    /// sliding window (§3 lifecycle, expiry pass).
    pub fn expire_before(&mut self, cutoff: Timestamp) {
        self.entries.retain(|_, e| e.last_activity >= cutoff);
    }

    /// Fold one packet's TCP segment into the tracker. `forward` is the
    /// canonical direction flag from §4.2: `true` means this packet's raw
    /// source was the canonical `lo` endpoint.
    pub fn record(
        &mut self,
        key: CanonicalKey,
        forward: bool,
        now: Timestamp,
        seg: &TcpSegment,
    ) {
        let entry = self.entries.entry(key).or_insert_with(|| TcpRttEntry::new(now));
        entry.last_activity = now;
        entry.state = entry
            .state
            .advance(seg.syn, seg.ack_flag, seg.fin, seg.rst, seg.payload_len > 0);

        let (sender, receiver) = if forward {
            (&mut entry.fwd, &mut entry.rev)
        } else {
            (&mut entry.rev, &mut entry.fwd)
        };

        if seg.payload_len > 0 {
            let seq_end = seg.seq.wrapping_add(seg.payload_len);
            sender.push_outstanding(seq_end, now);
        }
        if seg.ack_flag {
            // An ACK samples RTT against whatever the *receiver* direction
            // previously sent — the opposite direction's outstanding ring.
            receiver.on_ack(seg.ack, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalAddrs;
    use crate::flow_key::L4Proto;

    fn key() -> CanonicalKey {
        CanonicalKey {
            addrs: CanonicalAddrs::V4 {
                lo: [10, 0, 0, 1],
                hi: [10, 0, 0, 2],
            },
            lo_port: 1234,
            hi_port: 80,
            l4_proto: L4Proto::Tcp,
        }
    }

    fn data_seg(seq: u32, len: u32) -> TcpSegment {
        TcpSegment {
            seq,
            ack: 0,
            window_raw: 0,
            payload_len: len,
            syn: false,
            ack_flag: false,
            fin: false,
            rst: false,
            ece: false,
            cwr: false,
            window_scale_opt: None,
        }
    }

    fn ack_seg(ack: u32) -> TcpSegment {
        TcpSegment {
            seq: 0,
            ack,
            window_raw: 0,
            payload_len: 0,
            syn: false,
            ack_flag: true,
            fin: false,
            rst: false,
            ece: false,
            cwr: false,
            window_scale_opt: None,
        }
    }

    #[test]
    fn basic_rtt_from_single_segment() {
        let mut t = RttTracker::new();
        let k = key();
        t.record(k, true, Timestamp::new(0, 0), &data_seg(1000, 100));
        t.record(k, false, Timestamp::new(0, 50_000), &ack_seg(1100));
        assert_eq!(t.get(&k).unwrap().ewma_us(true), 50_000);
    }

    #[test]
    fn ewma_smoothing_matches_shift_three() {
        let mut t = RttTracker::new();
        let k = key();
        t.record(k, true, Timestamp::new(0, 0), &data_seg(1000, 10));
        t.record(k, false, Timestamp::new(0, 100_000), &ack_seg(1010));
        assert_eq!(t.get(&k).unwrap().ewma_us(true), 100_000);

        t.record(k, true, Timestamp::new(1, 0), &data_seg(1010, 10));
        t.record(k, false, Timestamp::new(1, 20_000), &ack_seg(1020));
        assert_eq!(t.get(&k).unwrap().ewma_us(true), 90_000);
    }

    #[test]
    fn cumulative_ack_samples_last_matched_segment() {
        let mut t = RttTracker::new();
        let k = key();
        t.record(k, true, Timestamp::new(0, 0), &data_seg(1000, 10));
        t.record(k, true, Timestamp::new(0, 1_000), &data_seg(1010, 10));
        t.record(k, true, Timestamp::new(0, 2_000), &data_seg(1020, 10));
        t.record(k, false, Timestamp::new(0, 60_000), &ack_seg(1030));
        assert_eq!(t.get(&k).unwrap().ewma_us(true), 58_000);
    }

    #[test]
    fn sequence_wrap_is_handled_by_signed_comparison() {
        let mut t = RttTracker::new();
        let k = key();
        let seq: u32 = 0xFFFF_FFF0;
        t.record(k, true, Timestamp::new(0, 0), &data_seg(seq, 100));
        let wrapped_ack = seq.wrapping_add(100);
        t.record(k, false, Timestamp::new(0, 25_000), &ack_seg(wrapped_ack));
        assert_eq!(t.get(&k).unwrap().ewma_us(true), 25_000);
    }
}
