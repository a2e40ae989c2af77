//! Ethernet / Linux-cooked (SLL) link headers, plus single-layer VLAN peel.

use crate::error::DecodeError;

/// The two link types the capture source may deliver (§6); anything else
/// is rejected at init, before any frame reaches the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    LinuxCooked,
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_VLAN_QINQ: u16 = 0x88A8;
const ETHERTYPE_LLDP: u16 = 0x88CC;

/// Peel the link header and at most one VLAN tag, returning the L3
/// ethertype and the offset of the L3 header within `frame`.
pub fn peel_link_and_vlan(link_type: LinkType, frame: &[u8]) -> Result<(u16, usize), DecodeError> {
    let (ethertype, offset) = match link_type {
        LinkType::Ethernet => peel_ethernet(frame)?,
        LinkType::LinuxCooked => peel_sll(frame)?,
    };
    peel_one_vlan(ethertype, frame, offset)
}

fn peel_ethernet(frame: &[u8]) -> Result<(u16, usize), DecodeError> {
    if frame.len() < 14 {
        return Err(DecodeError::Malformed("ethernet header truncated"));
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Ok((ethertype, 14))
}

/// DLT_LINUX_SLL: a 16-byte pseudo-header, ethertype at bytes 14..16.
fn peel_sll(frame: &[u8]) -> Result<(u16, usize), DecodeError> {
    if frame.len() < 16 {
        return Err(DecodeError::Malformed("sll header truncated"));
    }
    let ethertype = u16::from_be_bytes([frame[14], frame[15]]);
    Ok((ethertype, 16))
}

/// Tail-recurse exactly once on the inner ethertype if `ethertype` is a
/// VLAN tag (802.1Q or 802.1ad); anything past that is left alone (the
/// inner payload is decoded as whatever L3 protocol it claims to be, even
/// if that's itself another VLAN tag — the spec asks for one peel only).
fn peel_one_vlan(ethertype: u16, frame: &[u8], offset: usize) -> Result<(u16, usize), DecodeError> {
    if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_VLAN_QINQ {
        return classify(ethertype, offset);
    }
    if frame.len() < offset + 4 {
        return Err(DecodeError::Malformed("vlan tag truncated"));
    }
    let inner = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
    classify(inner, offset + 4)
}

fn classify(ethertype: u16, offset: usize) -> Result<(u16, usize), DecodeError> {
    match ethertype {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => Ok((ethertype, offset)),
        ETHERTYPE_ARP => Err(DecodeError::Ignored("arp")),
        ETHERTYPE_LLDP => Err(DecodeError::Ignored("lldp")),
        _ => Err(DecodeError::Unsupported("ethertype")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_frame(ethertype: u16, payload_len: usize) -> Vec<u8> {
        let mut f = vec![0u8; 14 + payload_len];
        f[12..14].copy_from_slice(&ethertype.to_be_bytes());
        f
    }

    #[test]
    fn plain_ipv4_ethernet() {
        let f = eth_frame(ETHERTYPE_IPV4, 20);
        let (ethertype, off) = peel_link_and_vlan(LinkType::Ethernet, &f).unwrap();
        assert_eq!(ethertype, ETHERTYPE_IPV4);
        assert_eq!(off, 14);
    }

    #[test]
    fn single_vlan_tag_peeled() {
        let mut f = eth_frame(ETHERTYPE_VLAN, 4 + 20);
        f[14..16].copy_from_slice(&[0x00, 0x0A]); // PCP/VID
        f[16..18].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let (ethertype, off) = peel_link_and_vlan(LinkType::Ethernet, &f).unwrap();
        assert_eq!(ethertype, ETHERTYPE_IPV4);
        assert_eq!(off, 18);
    }

    #[test]
    fn arp_is_ignored() {
        let f = eth_frame(ETHERTYPE_ARP, 28);
        assert_eq!(
            peel_link_and_vlan(LinkType::Ethernet, &f),
            Err(DecodeError::Ignored("arp"))
        );
    }

    #[test]
    fn truncated_ethernet_is_malformed() {
        let f = vec![0u8; 10];
        assert_eq!(
            peel_link_and_vlan(LinkType::Ethernet, &f),
            Err(DecodeError::Malformed("ethernet header truncated"))
        );
    }

    #[test]
    fn sll_header_offset() {
        let mut f = vec![0u8; 16 + 20];
        f[14..16].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        let (ethertype, off) = peel_link_and_vlan(LinkType::LinuxCooked, &f).unwrap();
        assert_eq!(ethertype, ETHERTYPE_IPV6);
        assert_eq!(off, 16);
    }
}
