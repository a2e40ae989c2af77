//! TCP window / congestion-event tracking (§4.7): window-scale capture,
//! zero-window hysteresis, triple dup-ACK, wrap-aware retransmit, ECE/CWR.

use std::collections::HashMap;

use crate::canonical::CanonicalKey;
use crate::time::Timestamp;

use super::TcpSegment;

/// Window-scale option is only ever read off a SYN/SYN-ACK; RFC 7323 caps
/// it at 14 regardless of what the wire claims.
const MAX_WINDOW_SCALE: u8 = 14;

/// Hysteresis floor for "the window recovered" before another zero-window
/// event can be edge-triggered: 5% of the largest window ever seen, or at
/// least one byte if that flow has never advertised a window worth 5% of.
const ZERO_WINDOW_RECOVERY_FRACTION: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleStatus {
    #[default]
    Unknown,
    Seen,
    NotPresent,
}

/// Bitmask of events seen in the most recently rotated interval, read by
/// queries on the *opposite* flow direction (§4.10 step 4: TCP events are
/// ORed into the reverse flow's `recent_events`).
pub mod recent_events {
    pub const ZERO_WINDOW: u8 = 1 << 0;
    pub const RETRANSMIT: u8 = 1 << 1;
    pub const DUP_ACK: u8 = 1 << 2;
    pub const ECE: u8 = 1 << 3;
    pub const CWR: u8 = 1 << 4;
}

#[derive(Debug, Clone)]
struct DirectionWindow {
    raw_window: u16,
    scaled_window: u32,
    scale: u8,
    scale_status: ScaleStatus,
    min_window: u32,
    max_window: u32,
    zero_window_count: u64,
    retransmit_count: u64,
    dup_ack_count: u64,
    ece_count: u64,
    cwr_count: u64,

    last_ack: Option<u32>,
    dup_ack_streak: u32,
    highest_seq_end: u32,
    highest_seq_valid: bool,
    in_zero_window: bool,
    /// Whether the window has climbed back over the hysteresis floor
    /// since the last edge-triggered zero-window event — starts `true`
    /// since there is nothing to recover from until the first zero.
    recovered_from_zero: bool,

    last_zero_window_at: Option<Timestamp>,
    last_retransmit_at: Option<Timestamp>,
    last_dup_ack_at: Option<Timestamp>,
    last_ece_at: Option<Timestamp>,
    last_cwr_at: Option<Timestamp>,

    pub recent_events: u8,
}

impl Default for DirectionWindow {
    fn default() -> Self {
        Self {
            raw_window: 0,
            scaled_window: 0,
            scale: 0,
            scale_status: ScaleStatus::Unknown,
            min_window: 0,
            max_window: 0,
            zero_window_count: 0,
            retransmit_count: 0,
            dup_ack_count: 0,
            ece_count: 0,
            cwr_count: 0,
            last_ack: None,
            dup_ack_streak: 0,
            highest_seq_end: 0,
            highest_seq_valid: false,
            in_zero_window: false,
            recovered_from_zero: true,
            last_zero_window_at: None,
            last_retransmit_at: None,
            last_dup_ack_at: None,
            last_ece_at: None,
            last_cwr_at: None,
            recent_events: 0,
        }
    }
}

impl DirectionWindow {
    fn apply_scale(&mut self, window_scale_opt: Option<u8>) {
        match (self.scale_status, window_scale_opt) {
            (ScaleStatus::Unknown, Some(scale)) => {
                self.scale = scale.min(MAX_WINDOW_SCALE);
                self.scale_status = ScaleStatus::Seen;
            }
            (ScaleStatus::Unknown, None) => {
                self.scale_status = ScaleStatus::NotPresent;
            }
            _ => {}
        }
    }

    fn sample_window(&mut self, raw: u16, now: Timestamp) {
        self.raw_window = raw;
        self.scaled_window = match self.scale_status {
            ScaleStatus::Seen => (raw as u32) << self.scale,
            _ => raw as u32,
        };
        self.min_window = if self.min_window == 0 {
            self.scaled_window
        } else {
            self.min_window.min(self.scaled_window)
        };
        self.max_window = self.max_window.max(self.scaled_window);

        let recovery_floor = (self.max_window / ZERO_WINDOW_RECOVERY_FRACTION).max(1);
        if self.scaled_window == 0 {
            // Raw count: every zero-window packet, for statistics.
            self.zero_window_count += 1;
            if self.recovered_from_zero {
                self.recent_events |= recent_events::ZERO_WINDOW;
                self.last_zero_window_at = Some(now);
                self.recovered_from_zero = false;
            }
            self.in_zero_window = true;
        } else {
            if self.in_zero_window {
                if self.scaled_window >= recovery_floor {
                    self.recovered_from_zero = true;
                }
            } else {
                self.recovered_from_zero = true;
            }
            self.in_zero_window = false;
        }
    }

    fn detect_dup_ack(&mut self, seg: &TcpSegment, now: Timestamp) {
        let is_pure_ack = seg.ack_flag && seg.payload_len == 0 && !seg.syn && !seg.fin && !seg.rst;
        if !is_pure_ack {
            self.dup_ack_streak = 0;
            self.last_ack = Some(seg.ack);
            return;
        }
        if self.last_ack == Some(seg.ack) {
            self.dup_ack_streak += 1;
            if self.dup_ack_streak == 3 {
                self.dup_ack_count += 1;
                self.recent_events |= recent_events::DUP_ACK;
                self.last_dup_ack_at = Some(now);
                self.dup_ack_streak = 0;
            }
        } else {
            self.dup_ack_streak = 0;
        }
        self.last_ack = Some(seg.ack);
    }

    fn detect_retransmit(&mut self, seg: &TcpSegment, now: Timestamp) {
        if seg.payload_len == 0 || seg.syn {
            return;
        }
        let seq_end = seg.seq.wrapping_add(seg.payload_len);
        if self.highest_seq_valid {
            let is_retransmit = (seg.seq.wrapping_sub(self.highest_seq_end) as i32) < 0;
            if is_retransmit {
                self.retransmit_count += 1;
                self.recent_events |= recent_events::RETRANSMIT;
                self.last_retransmit_at = Some(now);
                return;
            }
        }
        self.highest_seq_end = seq_end;
        self.highest_seq_valid = true;
    }

    fn record(&mut self, seg: &TcpSegment, now: Timestamp) {
        self.apply_scale(seg.window_scale_opt);
        self.sample_window(seg.window_raw, now);
        self.detect_dup_ack(seg, now);
        self.detect_retransmit(seg, now);
        if seg.ece {
            self.ece_count += 1;
            self.recent_events |= recent_events::ECE;
            self.last_ece_at = Some(now);
        }
        if seg.cwr {
            self.cwr_count += 1;
            self.recent_events |= recent_events::CWR;
            self.last_cwr_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcpWindowEntry {
    fwd: DirectionWindow,
    rev: DirectionWindow,
    pub last_activity: Timestamp,
}

impl TcpWindowEntry {
    pub fn scaled_window(&self, forward: bool) -> u32 {
        if forward {
            self.fwd.scaled_window
        } else {
            self.rev.scaled_window
        }
    }

    pub fn zero_window_count(&self, forward: bool) -> u64 {
        if forward {
            self.fwd.zero_window_count
        } else {
            self.rev.zero_window_count
        }
    }

    pub fn dup_ack_count(&self, forward: bool) -> u64 {
        if forward {
            self.fwd.dup_ack_count
        } else {
            self.rev.dup_ack_count
        }
    }

    pub fn retransmit_count(&self, forward: bool) -> u64 {
        if forward {
            self.fwd.retransmit_count
        } else {
            self.rev.retransmit_count
        }
    }

    /// All-time max advertised window for one direction, the basis for the
    /// per-interval low-window threshold (§4.4).
    pub fn max_window(&self, forward: bool) -> u32 {
        if forward {
            self.fwd.max_window
        } else {
            self.rev.max_window
        }
    }

    pub fn recent_events(&self, forward: bool) -> u8 {
        if forward {
            self.fwd.recent_events
        } else {
            self.rev.recent_events
        }
    }

    /// Clear the interval-scoped event bitmask after a rotation has
    /// consumed it (§4.10 step 4).
    pub fn clear_recent_events(&mut self) {
        self.fwd.recent_events = 0;
        self.rev.recent_events = 0;
    }
}

#[derive(Debug, Default)]
pub struct WindowTracker {
    entries: HashMap<CanonicalKey, TcpWindowEntry>,
}

impl WindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&TcpWindowEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn expire_before(&mut self, cutoff: Timestamp) {
        self.entries.retain(|_, e| e.last_activity >= cutoff);
    }

    /// Clear every live connection's interval-scoped event bitmask. Called
    /// once per tick, after rotation has folded the current mask into every
    /// currently-open interval record (§4.10 step 4) — without this, a
    /// connection's lifetime events would be re-OR'd into every
    /// newly-rotated interval forever instead of reflecting only events
    /// since the last clear.
    pub fn clear_all_recent_events(&mut self) {
        for entry in self.entries.values_mut() {
            entry.clear_recent_events();
        }
    }

    /// Fold one packet's TCP segment into the tracker. Per §4.10 step 4,
    /// the events this packet produces describe the *sender*'s behavior,
    /// so they belong to the sender's direction slot — callers wanting the
    /// "reverse flow's recent_events" convention read the other slot.
    pub fn record(&mut self, key: CanonicalKey, forward: bool, now: Timestamp, seg: &TcpSegment) {
        let entry = self.entries.entry(key).or_default();
        entry.last_activity = now;
        let sender = if forward { &mut entry.fwd } else { &mut entry.rev };
        sender.record(seg, now);
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

    fn seg(window_raw: u16) -> TcpSegment {
        TcpSegment {
            seq: 0,
            ack: 0,
            window_raw,
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
    fn zero_window_edge_triggers_after_recovery() {
        let mut t = WindowTracker::new();
        let k = key();
        let now = Timestamp::new(0, 0);
        t.record(k, true, now, &seg(65535));
        t.record(k, true, now, &seg(0));
        let e = t.get(&k).unwrap();
        assert_eq!(e.zero_window_count(true), 1);
        assert_ne!(e.recent_events(true) & recent_events::ZERO_WINDOW, 0);
    }

    #[test]
    fn clear_all_recent_events_resets_every_live_entry() {
        // Without a periodic clear, `recent_events` would stay set for the
        // rest of the connection's life and keep getting folded into every
        // interval rotated after the event actually happened.
        let mut t = WindowTracker::new();
        let k = key();
        let now = Timestamp::new(0, 0);
        t.record(k, true, now, &seg(65535));
        t.record(k, true, now, &seg(0));
        assert_ne!(t.get(&k).unwrap().recent_events(true) & recent_events::ZERO_WINDOW, 0);

        t.clear_all_recent_events();
        assert_eq!(t.get(&k).unwrap().recent_events(true), 0);

        // A later packet with no new event keeps the mask clear instead of
        // re-surfacing the old zero-window event.
        t.record(k, true, now, &seg(65535));
        assert_eq!(t.get(&k).unwrap().recent_events(true), 0);
    }

    #[test]
    fn triple_dup_ack_counts_once() {
        let mut t = WindowTracker::new();
        let k = key();
        let now = Timestamp::new(0, 0);
        let mut ack = seg(1000);
        ack.ack = 500;
        for _ in 0..4 {
            t.record(k, true, now, &ack);
        }
        assert_eq!(t.get(&k).unwrap().dup_ack_count(true), 1);
    }

    #[test]
    fn retransmit_detected_on_seq_regression() {
        let mut t = WindowTracker::new();
        let k = key();
        let now = Timestamp::new(0, 0);
        let mut first = seg(1000);
        first.payload_len = 100;
        first.seq = 1000;
        t.record(k, true, now, &first);

        let mut retransmit = seg(1000);
        retransmit.payload_len = 100;
        retransmit.seq = 1000;
        t.record(k, true, now, &retransmit);

        assert_eq!(t.get(&k).unwrap().retransmit_count(true), 1);
    }

    #[test]
    fn window_scale_capped_at_fourteen() {
        let mut t = WindowTracker::new();
        let k = key();
        let now = Timestamp::new(0, 0);
        let mut syn = seg(100);
        syn.syn = true;
        syn.window_scale_opt = Some(20);
        t.record(k, true, now, &syn);
        t.record(k, true, now, &seg(100));
        // scaled = raw << 14, not << 20.
        assert_eq!(t.get(&k).unwrap().scaled_window(true), 100u32 << 14);
    }
}
