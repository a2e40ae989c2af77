//! Bounded per-packet ring spanning the sliding window (§4.3).
//!
//! Not built on the `ringbuf` crate: that crate is a SPSC streaming queue
//! (push/pop from the ends only), while expiry here needs indexed access
//! to the tail entry while the head keeps advancing — the same shape as
//! a textbook circular buffer, not a producer/consumer handoff. A plain
//! `Vec`-backed ring indexed by `head & (capacity - 1)` matches how the
//! teacher's own bounded buffers are built where `ringbuf` doesn't fit
//! (see `bass-srt`'s jitter buffer), so that's the pattern here too.

use crate::flow_key::FlowKey;
use crate::time::Timestamp;

/// One packet's contribution to the sliding window (§3).
#[derive(Debug, Clone, Copy)]
pub struct PacketRingEntry {
    pub key: FlowKey,
    pub bytes: i64,
    pub timestamp: Timestamp,
    /// Scaled TCP receive window advertised by this packet, if any (§4.7
    /// samples window per-packet off the ring as it expires, not just on
    /// arrival).
    pub scaled_window: Option<u32>,
}

/// Power-of-two capacity ring of `PacketRingEntry`. `head` is the next
/// write index (monotonically increasing); `tail` is the oldest live
/// index. `head - tail` is always `<= capacity`.
pub struct PacketRing {
    capacity: usize,
    mask: usize,
    slots: Vec<Option<PacketRingEntry>>,
    head: u64,
    tail: u64,
    /// Count of in-place overwrites of an unexpired slot — surfaces the
    /// spec's Open Question about ring-wrap data loss as a real counter
    /// rather than silence (§9).
    pub overwrites: u64,
}

impl PacketRing {
    /// `capacity` must be a power of two; anything else is a construction
    /// error the caller should reject before starting the engine.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return None;
        }
        Some(Self {
            capacity,
            mask: capacity - 1,
            slots: vec![None; capacity],
            head: 0,
            tail: 0,
            overwrites: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Append a new entry at `head`, overwriting the oldest slot in place
    /// if the ring is already full. Returns the entry that was overwritten,
    /// if any, so the caller can reconcile its FlowRecord before losing it.
    pub fn push(&mut self, entry: PacketRingEntry) -> Option<PacketRingEntry> {
        let idx = (self.head & self.mask as u64) as usize;
        let evicted = if self.len() as u64 == self.capacity as u64 {
            self.overwrites += 1;
            self.tail += 1;
            self.slots[idx].take()
        } else {
            None
        };
        self.slots[idx] = Some(entry);
        self.head += 1;
        evicted
    }

    /// Peek the oldest live entry without removing it.
    pub fn front(&self) -> Option<&PacketRingEntry> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.tail & self.mask as u64) as usize;
        self.slots[idx].as_ref()
    }

    /// Remove and return the oldest live entry.
    pub fn pop_front(&mut self) -> Option<PacketRingEntry> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.tail & self.mask as u64) as usize;
        self.tail += 1;
        self.slots[idx].take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_key::{FlowAddrs, L4Proto};
    use std::net::Ipv4Addr;

    fn entry(bytes: i64, sec: i64) -> PacketRingEntry {
        PacketRingEntry {
            key: FlowKey {
                addrs: FlowAddrs::V4 {
                    src: Ipv4Addr::new(10, 0, 0, 1),
                    dst: Ipv4Addr::new(10, 0, 0, 2),
                },
                src_port: 1234,
                dst_port: 80,
                l4_proto: L4Proto::Tcp,
                traffic_class: 0,
            },
            bytes,
            timestamp: Timestamp::new(sec, 0),
            scaled_window: None,
        }
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert!(PacketRing::new(3).is_none());
        assert!(PacketRing::new(4).is_some());
    }

    #[test]
    fn push_and_pop_front_preserve_order() {
        let mut ring = PacketRing::new(4).unwrap();
        ring.push(entry(10, 0));
        ring.push(entry(20, 1));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop_front().unwrap().bytes, 10);
        assert_eq!(ring.pop_front().unwrap().bytes, 20);
        assert!(ring.is_empty());
    }

    #[test]
    fn overwrites_oldest_when_full_and_counts_it() {
        let mut ring = PacketRing::new(2).unwrap();
        ring.push(entry(1, 0));
        ring.push(entry(2, 1));
        let evicted = ring.push(entry(3, 2));
        assert_eq!(evicted.unwrap().bytes, 1);
        assert_eq!(ring.overwrites, 1);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.front().unwrap().bytes, 2);
    }
}
