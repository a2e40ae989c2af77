//! Link decoder (§4.1): Ethernet/SLL + VLAN + IPv4/IPv6 + TCP/UDP/ICMP/
//! ICMPv6/IGMP/ESP into a `FlowKey` and the L4 payload offset.
//!
//! Mirrors the teacher's `RtpHeader::parse` style (bounds-check, pull
//! fields with `from_be_bytes`, return `None`/an error rather than panic)
//! but layered for a full link-to-transport walk instead of one fixed
//! 12-byte header.

mod ethernet;
mod ipv4;
mod ipv6;
mod transport;

use crate::error::DecodeError;
use crate::flow_key::FlowKey;

pub use ethernet::LinkType;

/// Result of a successful decode: the flow identity, the wire byte count
/// to credit (original length, per §4.1), and the offset of the L4 header
/// within `frame` (for callers that need the transport payload too).
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub key: FlowKey,
    pub l4_offset: usize,
    /// Start of the L4 header itself (distinct from `l4_offset`, which for
    /// TCP is the payload start past a variable-length options area) — the
    /// TCP updates step needs this to re-read seq/ack/flags/window.
    pub l4_header_offset: usize,
}

/// Decode one captured frame. `original_len` is the on-the-wire length
/// (used as the byte count callers should credit, per §4.1); `frame` is
/// the captured bytes, which may be shorter than `original_len` if the
/// capture snaplen truncated it.
pub fn decode_frame(link_type: LinkType, frame: &[u8]) -> Result<Decoded, DecodeError> {
    let (ethertype, l3_offset) = ethernet::peel_link_and_vlan(link_type, frame)?;
    transport::decode_l3(ethertype, frame, l3_offset)
}

pub(crate) use transport::decode_l3;
