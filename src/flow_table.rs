//! Sliding-window flow table (§4.3): a bounded ring of per-packet entries
//! plus a hash of cumulative per-flow totals over the window.
//!
//! On each accepted packet the ring's tail is advanced past anything older
//! than the window, each expired entry's bytes/packets are subtracted from
//! its `FlowRecord` (removing the record once its bytes reach zero), and
//! the new entry is appended and added in. Totals are maintained
//! incrementally — never recomputed from the live set — so the invariants
//! in §8 (`totals.bytes >= 0`, `flow_count == 0 <=> totals.bytes == 0`) hold
//! at every call boundary, not just at tick boundaries where `debug_assert!`
//! checks them.

use std::collections::HashMap;

use crate::flow_key::FlowKey;
use crate::ring::{PacketRing, PacketRingEntry};
use crate::time::Timestamp;

/// Cumulative bytes/packets for one flow within the sliding window (§3).
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowRecord {
    pub bytes: i64,
    pub packets: i64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlowTableTotals {
    pub bytes: i64,
    pub packets: i64,
}

pub struct SlidingWindowFlowTable {
    ring: PacketRing,
    window_size_us: i64,
    records: HashMap<FlowKey, FlowRecord>,
    totals: FlowTableTotals,
}

impl SlidingWindowFlowTable {
    pub fn new(ring_capacity: usize, window_size_us: i64) -> Option<Self> {
        let ring = PacketRing::new(ring_capacity)?;
        Some(Self {
            ring,
            window_size_us,
            records: HashMap::new(),
            totals: FlowTableTotals::default(),
        })
    }

    pub fn totals(&self) -> FlowTableTotals {
        self.totals
    }

    pub fn flow_count(&self) -> usize {
        self.records.len()
    }

    pub fn ring_overwrites(&self) -> u64 {
        self.ring.overwrites
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowRecord> {
        self.records.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, &FlowRecord)> {
        self.records.iter()
    }

    /// Remove a packet's contribution from its flow's totals, deleting the
    /// record once its bytes reach zero (§3 lifecycle, §4.3).
    fn retire(&mut self, entry: &PacketRingEntry) {
        self.totals.bytes -= entry.bytes;
        self.totals.packets -= 1;
        if let std::collections::hash_map::Entry::Occupied(mut occ) =
            self.records.entry(entry.key)
        {
            let rec = occ.get_mut();
            rec.bytes -= entry.bytes;
            rec.packets -= 1;
            if rec.bytes <= 0 {
                occ.remove();
            }
        }
        debug_assert!(self.totals.bytes >= 0, "sliding window totals.bytes underflow");
        debug_assert!(self.totals.packets >= 0, "sliding window totals.packets underflow");
    }

    /// Expire every ring entry older than `now - window_size` (tail
    /// advance), then append the new packet and account for it. Returns the
    /// entry evicted by an on-time-expiry-failure overwrite, if any — the
    /// caller cannot do anything but count it (§9 Open Question: ring wrap
    /// is surfaced as `PacketRing::overwrites`, not silently dropped).
    pub fn record_packet(&mut self, key: FlowKey, bytes: i64, now: Timestamp) {
        self.expire_older_than(now);

        let evicted = self.ring.push(PacketRingEntry {
            key,
            bytes,
            timestamp: now,
            scaled_window: None,
        });
        if let Some(evicted) = evicted {
            // The ring was still full after on-time expiry: this packet's
            // predecessor at this slot is force-retired out of order.
            self.retire(&evicted);
        }

        self.totals.bytes += bytes;
        self.totals.packets += 1;
        let rec = self.records.entry(key).or_insert_with(|| FlowRecord {
            bytes: 0,
            packets: 0,
            first_seen: now,
            last_seen: now,
        });
        rec.bytes += bytes;
        rec.packets += 1;
        rec.last_seen = now;

        debug_assert!(
            self.flow_count() > 0 || self.totals.bytes == 0,
            "flow_count == 0 must imply totals.bytes == 0"
        );
    }

    /// Advance the ring tail, retiring every entry whose `timestamp +
    /// window_size < deadline` (§4.3). Called both inline (before each
    /// insert) and once more at the top of each tick so flows with no new
    /// traffic still age out of the window on schedule.
    pub fn expire_older_than(&mut self, deadline: Timestamp) {
        while let Some(front) = self.ring.front() {
            if front.timestamp.add_micros(self.window_size_us) >= deadline {
                break;
            }
            let evicted = self.ring.pop_front().expect("front() returned Some");
            self.retire(&evicted);
        }
    }

    /// The §8 quantified invariants, checked in debug builds at tick
    /// boundaries (§9: "assert-driven invariants kept as runtime checks in
    /// debug builds").
    #[cfg(debug_assertions)]
    pub fn assert_invariants(&self) {
        assert!(self.totals.bytes >= 0 && self.totals.packets >= 0);
        assert_eq!(self.records.is_empty(), self.totals.bytes == 0);
        assert_eq!(self.totals.bytes == 0, self.totals.packets == 0);
    }
}
