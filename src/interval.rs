//! Interval table bank (§4.4): `N` hash tables, one per configured
//! duration, each double-buffered into an `incomplete` (accumulating) and
//! `complete` (last finalized, read by rankers) pair.
//!
//! Rotation is a pointer swap, not a copy — freeing the stale `complete` is
//! the only O(n) work, exactly as §9 re-architects the teacher's
//! copy-all-entries rotation.

use std::collections::HashMap;

use crate::flow_key::FlowKey;
use crate::time::Timestamp;

/// Window-condition flags computed per flow, per interval, from that
/// interval's accumulated advertised-window samples (§4.4).
pub mod window_condition {
    pub const ZERO_SEEN: u8 = 1 << 0;
    pub const LOW: u8 = 1 << 1;
    pub const STARVING: u8 = 1 << 2;
    pub const RECOVERED: u8 = 1 << 3;
}

/// Running sum/min/max of one flow's advertised TCP window samples within
/// one interval, feeding the low/starving/recovered classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowAccum {
    pub sum: u64,
    pub samples: u64,
    pub min: u32,
    pub max: u32,
}

impl WindowAccum {
    pub fn record(&mut self, scaled_window: u32) {
        self.sum += scaled_window as u64;
        self.min = if self.samples == 0 {
            scaled_window
        } else {
            self.min.min(scaled_window)
        };
        self.max = self.max.max(scaled_window);
        self.samples += 1;
    }
}

/// One flow's state within one interval (§3 `IntervalTable`'s per-flow
/// `FlowRecord` plus the window-condition accumulators).
#[derive(Debug, Clone, Default)]
pub struct IntervalFlowRecord {
    pub bytes: i64,
    pub packets: i64,
    pub window: WindowAccum,
    /// Consecutive low intervals observed so far. Seeded from
    /// `IntervalTable::low_streaks` at rotation time and written back there
    /// afterwards, since this record itself is recreated fresh every
    /// rotation (§4.4 "Starving after >= 3 consecutive low intervals").
    pub low_streak: u32,
    pub conditions: u8,
    /// TCP events detected during this interval, ORed in from the reverse
    /// flow's tracker per §4.10 step 4; cleared once a rotation reads it.
    pub recent_events: u8,
}

impl IntervalFlowRecord {
    pub fn add_packet(&mut self, bytes: i64) {
        self.bytes += bytes;
        self.packets += 1;
    }

    /// Evaluate `ZeroSeen`/`Low`/`Starving`/`Recovered` from this interval's
    /// accumulated window samples, immediately before rotation (§4.4).
    /// `lifetime_max_window` is the connection's all-time max (from the TCP
    /// window tracker), used for the "low" threshold.
    pub fn evaluate_window_conditions(&mut self, lifetime_max_window: u32) {
        if self.window.samples == 0 {
            return;
        }
        let mut conditions = 0u8;
        if self.window.min == 0 {
            conditions |= window_condition::ZERO_SEEN;
        }
        let threshold = (lifetime_max_window / 4).max(1460);
        if self.window.max < threshold {
            self.low_streak += 1;
            conditions |= window_condition::LOW;
            if self.low_streak >= 3 {
                conditions |= window_condition::STARVING;
            }
        } else {
            if self.low_streak > 0 {
                conditions |= window_condition::RECOVERED;
            }
            self.low_streak = 0;
        }
        self.conditions = conditions;
    }
}

/// One side of a double-buffered interval: the hash of per-flow records
/// plus the `[start, end)` deadline this slot covers.
#[derive(Debug, Default)]
pub struct IntervalSlot {
    pub records: HashMap<FlowKey, IntervalFlowRecord>,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// One configured duration's incomplete/complete pair (§3, §4.4).
pub struct IntervalTable {
    pub duration_us: i64,
    pub incomplete: IntervalSlot,
    pub complete: IntervalSlot,
    /// Per-flow low-window streak, persisted across rotations since each
    /// rotation recreates `incomplete.records` from scratch. Pruned to the
    /// flows present in `complete` after every rotation so it doesn't grow
    /// without bound as flows churn.
    low_streaks: HashMap<FlowKey, u32>,
}

impl IntervalTable {
    fn new(duration_us: i64, start: Timestamp) -> Self {
        Self {
            duration_us,
            incomplete: IntervalSlot {
                records: HashMap::new(),
                start,
                end: start.add_micros(duration_us),
            },
            complete: IntervalSlot::default(),
            low_streaks: HashMap::new(),
        }
    }

    pub fn add_packet(&mut self, key: FlowKey, bytes: i64) {
        self.incomplete
            .records
            .entry(key)
            .or_default()
            .add_packet(bytes);
    }

    /// Fold a window sample and/or TCP event bitmask into the *reverse*
    /// flow's record for this interval (§4.10 step 4: "TCP events detected
    /// on a packet are ORed into the reverse flow's recent_events").
    pub fn fold_tcp_observation(
        &mut self,
        reverse_key: FlowKey,
        window_sample: Option<u32>,
        events: u8,
    ) {
        if window_sample.is_none() && events == 0 {
            return;
        }
        let rec = self.incomplete.records.entry(reverse_key).or_default();
        if let Some(w) = window_sample {
            rec.window.record(w);
        }
        rec.recent_events |= events;
    }

    /// `true` once `now` has passed this table's end deadline.
    pub fn due(&self, now: Timestamp) -> bool {
        now > self.incomplete.end
    }

    /// Rotate: finalize window conditions on every record that saw window
    /// samples, swap `incomplete` into `complete`, and start a fresh
    /// `incomplete` slot beginning where the old one ended.
    ///
    /// `lifetime_max_window` resolves a flow's all-time max window (from
    /// the TCP window tracker) for the low-window threshold; it returns
    /// `0` for flows with no TCP tracker entry, which only weakens the
    /// threshold to `1460` (the floor), never panics.
    pub fn rotate(&mut self, now: Timestamp, lifetime_max_window: impl Fn(&FlowKey) -> u32) {
        for (key, rec) in self.incomplete.records.iter_mut() {
            if rec.window.samples > 0 {
                rec.low_streak = *self.low_streaks.get(key).unwrap_or(&0);
            }
            rec.evaluate_window_conditions(lifetime_max_window(key));
            if rec.window.samples > 0 {
                self.low_streaks.insert(*key, rec.low_streak);
            }
        }
        let next_start = self.incomplete.end;
        let new_incomplete = IntervalSlot {
            records: HashMap::new(),
            start: next_start,
            end: next_start.add_micros(self.duration_us),
        };
        self.complete = std::mem::replace(&mut self.incomplete, new_incomplete);
        let complete_records = &self.complete.records;
        self.low_streaks.retain(|k, _| complete_records.contains_key(k));
        let _ = now;
    }
}

/// The bank of `N` interval tables, indexed the same way as the configured
/// duration list (§2 component 6, §4.4).
pub struct IntervalBank {
    pub tables: Vec<IntervalTable>,
}

impl IntervalBank {
    pub fn new(durations_us: &[i64], start: Timestamp) -> Self {
        let tables = durations_us
            .iter()
            .map(|&d| IntervalTable::new(d, start))
            .collect();
        Self { tables }
    }

    pub fn add_packet(&mut self, key: FlowKey, bytes: i64) {
        for table in &mut self.tables {
            table.add_packet(key, bytes);
        }
    }

    pub fn fold_tcp_observation(&mut self, reverse_key: FlowKey, window_sample: Option<u32>, events: u8) {
        for table in &mut self.tables {
            table.fold_tcp_observation(reverse_key, window_sample, events);
        }
    }

    /// Index 0 holds the shortest configured interval, the one PPS
    /// histograms roll up from (§4.5).
    pub fn shortest(&self) -> &IntervalTable {
        &self.tables[0]
    }

    /// Rotate every table whose deadline has passed. Returns the packet
    /// counts from index 0's about-to-be-rotated incomplete slot, keyed by
    /// flow, for the caller to fold into per-flow PPS histograms before the
    /// swap discards them (§4.4/§4.5).
    pub fn rotate_due(
        &mut self,
        now: Timestamp,
        lifetime_max_window: impl Fn(&FlowKey) -> u32 + Copy,
    ) -> Vec<(FlowKey, i64)> {
        let mut pps_input = Vec::new();
        for (i, table) in self.tables.iter_mut().enumerate() {
            if !table.due(now) {
                continue;
            }
            if i == 0 {
                pps_input = table
                    .incomplete
                    .records
                    .iter()
                    .map(|(k, r)| (*k, r.packets))
                    .collect();
            }
            table.rotate(now, lifetime_max_window);
        }
        pps_input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_key::{FlowAddrs, L4Proto};
    use std::net::Ipv4Addr;

    fn key() -> FlowKey {
        FlowKey {
            addrs: FlowAddrs::V4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
            },
            src_port: 1234,
            dst_port: 80,
            l4_proto: L4Proto::Tcp,
            traffic_class: 0,
        }
    }

    #[test]
    fn rotation_moves_incomplete_to_complete_and_resets() {
        let mut bank = IntervalBank::new(&[1_000_000], Timestamp::new(0, 0));
        bank.add_packet(key(), 100);
        bank.add_packet(key(), 100);
        assert_eq!(bank.tables[0].incomplete.records[&key()].packets, 2);

        bank.rotate_due(Timestamp::new(1, 200_000), |_| 0);
        assert_eq!(bank.tables[0].complete.records[&key()].packets, 2);
        assert!(bank.tables[0].incomplete.records.is_empty());
    }

    #[test]
    fn not_due_before_deadline() {
        let mut bank = IntervalBank::new(&[1_000_000], Timestamp::new(0, 0));
        bank.add_packet(key(), 100);
        bank.rotate_due(Timestamp::new(0, 500_000), |_| 0);
        assert_eq!(bank.tables[0].incomplete.records[&key()].packets, 1);
        assert!(bank.tables[0].complete.records.is_empty());
    }

    #[test]
    fn evaluate_window_conditions_counts_a_single_low_sample() {
        // Exercises `IntervalFlowRecord::evaluate_window_conditions` in
        // isolation, reusing one record across calls the way a single
        // interval's accumulator would see repeated low samples within
        // itself. Cross-rotation persistence is covered separately by
        // `starving_and_recovered_persist_across_real_rotations` below,
        // since this record is never the one `IntervalTable::rotate`
        // actually recreates each interval.
        let mut rec = IntervalFlowRecord::default();
        rec.window.record(100);
        rec.evaluate_window_conditions(10_000); // threshold = 2500, 100 < it => low
        assert_eq!(rec.low_streak, 1);
        assert_ne!(rec.conditions & window_condition::LOW, 0);
        assert_eq!(rec.conditions & window_condition::STARVING, 0);
    }

    #[test]
    fn zero_seen_flag_set_when_min_window_is_zero() {
        let mut rec = IntervalFlowRecord::default();
        rec.window.record(0);
        rec.window.record(1000);
        rec.evaluate_window_conditions(10_000);
        assert_ne!(rec.conditions & window_condition::ZERO_SEEN, 0);
    }

    /// Drives three real `IntervalTable::rotate()` calls, each seeing one
    /// low-window sample for the same flow via `fold_tcp_observation` (the
    /// only path real packets take into the window accumulator), and
    /// checks STARVING fires on the third and RECOVERED on a subsequent
    /// high-window interval. A version of this test that reused one
    /// `IntervalFlowRecord` across calls instead of rotating would pass
    /// even if the streak were never carried across rotations — see the
    /// review comment this test was added to address.
    #[test]
    fn starving_and_recovered_persist_across_real_rotations() {
        let mut table = IntervalTable::new(1_000_000, Timestamp::new(0, 0));
        let k = key();
        let lifetime_max_window = |_: &FlowKey| 10_000u32; // threshold = 2500

        for i in 1..=3i64 {
            table.fold_tcp_observation(k, Some(100), 0); // low: below threshold
            table.rotate(Timestamp::new(i, 200_000), lifetime_max_window);
            let rec = &table.complete.records[&k];
            assert_eq!(rec.low_streak, i as u32);
            assert_ne!(rec.conditions & window_condition::LOW, 0);
            if i < 3 {
                assert_eq!(
                    rec.conditions & window_condition::STARVING,
                    0,
                    "must not starve before 3 consecutive low intervals"
                );
            } else {
                assert_ne!(
                    rec.conditions & window_condition::STARVING,
                    0,
                    "must starve on the 3rd consecutive low interval"
                );
            }
        }

        table.fold_tcp_observation(k, Some(100_000), 0); // recovers above threshold
        table.rotate(Timestamp::new(4, 200_000), lifetime_max_window);
        let rec = &table.complete.records[&k];
        assert_eq!(rec.low_streak, 0);
        assert_ne!(rec.conditions & window_condition::RECOVERED, 0);
    }
}
