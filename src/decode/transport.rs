//! L3 dispatch (IPv4/IPv6) and L4 decode (TCP/UDP/ICMP/ICMPv6/IGMP/ESP)
//! into a `FlowKey` and the payload offset (§4.1).

use super::ipv4;
use super::ipv6;
use super::Decoded;
use crate::error::DecodeError;
use crate::flow_key::{FlowAddrs, FlowKey, L4Proto};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

const PROTO_ICMP: u8 = 1;
const PROTO_IGMP: u8 = 2;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ESP: u8 = 50;
const PROTO_ICMPV6: u8 = 58;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

pub fn decode_l3(ethertype: u16, frame: &[u8], offset: usize) -> Result<Decoded, DecodeError> {
    match ethertype {
        ETHERTYPE_IPV4 => {
            let p = ipv4::parse(frame, offset)?;
            let addrs = FlowAddrs::V4 {
                src: p.src.into(),
                dst: p.dst.into(),
            };
            decode_l4(addrs, p.proto, p.dscp, frame, p.l4_offset)
        }
        ETHERTYPE_IPV6 => {
            let p = ipv6::parse(frame, offset)?;
            let addrs = FlowAddrs::V6 {
                src: p.src.into(),
                dst: p.dst.into(),
            };
            decode_l4(addrs, p.proto, p.dscp, frame, p.l4_offset)
        }
        _ => Err(DecodeError::Unsupported("ethertype")),
    }
}

fn decode_l4(
    addrs: FlowAddrs,
    proto: u8,
    dscp: u8,
    frame: &[u8],
    offset: usize,
) -> Result<Decoded, DecodeError> {
    let (l4_proto, src_port, dst_port, l4_offset) = match proto {
        PROTO_TCP => decode_tcp(frame, offset)?,
        PROTO_UDP => decode_udp(frame, offset)?,
        PROTO_ICMP => decode_icmp(frame, offset)?,
        PROTO_ICMPV6 => decode_icmpv6(frame, offset)?,
        PROTO_IGMP => (L4Proto::Igmp, 0, 0, offset),
        PROTO_ESP => (L4Proto::Esp, 0, 0, offset),
        other => (L4Proto::Other(other), 0, 0, offset),
    };

    Ok(Decoded {
        key: FlowKey {
            addrs,
            src_port,
            dst_port,
            l4_proto,
            traffic_class: dscp,
        },
        l4_offset,
        l4_header_offset: offset,
    })
}

fn decode_tcp(frame: &[u8], offset: usize) -> Result<(L4Proto, u16, u16, usize), DecodeError> {
    if frame.len() < offset + 20 {
        return Err(DecodeError::Malformed("tcp header truncated"));
    }
    let b = &frame[offset..];
    let src_port = u16::from_be_bytes([b[0], b[1]]);
    let dst_port = u16::from_be_bytes([b[2], b[3]]);
    let data_offset = (b[12] >> 4) as usize;
    if data_offset < 5 {
        return Err(DecodeError::Malformed("tcp data_offset < 5"));
    }
    let header_len = data_offset * 4;
    if frame.len() < offset + header_len {
        return Err(DecodeError::Malformed("tcp options truncated"));
    }
    Ok((L4Proto::Tcp, src_port, dst_port, offset + header_len))
}

fn decode_udp(frame: &[u8], offset: usize) -> Result<(L4Proto, u16, u16, usize), DecodeError> {
    if frame.len() < offset + 8 {
        return Err(DecodeError::Malformed("udp header truncated"));
    }
    let b = &frame[offset..];
    let src_port = u16::from_be_bytes([b[0], b[1]]);
    let dst_port = u16::from_be_bytes([b[2], b[3]]);
    Ok((L4Proto::Udp, src_port, dst_port, offset + 8))
}

/// ICMP Echo/Echo-Reply synthesize pseudo-ports from `(type<<8)|code` and
/// the identifier, so a ping request/reply pair forms one bidirectional
/// flow (§4.1). Other ICMP types get port 0 on both sides.
fn decode_icmp(frame: &[u8], offset: usize) -> Result<(L4Proto, u16, u16, usize), DecodeError> {
    if frame.len() < offset + 8 {
        return Err(DecodeError::Malformed("icmp header truncated"));
    }
    let b = &frame[offset..];
    let icmp_type = b[0];
    let code = b[1];
    let type_code = u16::from_be_bytes([icmp_type, code]);
    let l4_offset = offset + 8;

    if icmp_type == ICMP_ECHO_REQUEST || icmp_type == ICMP_ECHO_REPLY {
        let identifier = u16::from_be_bytes([b[4], b[5]]);
        // Request: src=(type_code, id), dst=(0,0). Reply is the mirror
        // image, and since Echo-Reply's type differs from Echo-Request
        // the pseudo "source port" differs too — callers rely on
        // canonicalization (§4.2) to fold request/reply onto one entry,
        // not on byte equality of the raw FlowKey.
        Ok((L4Proto::Icmp, type_code, identifier, l4_offset))
    } else {
        Ok((L4Proto::Icmp, 0, 0, l4_offset))
    }
}

fn decode_icmpv6(frame: &[u8], offset: usize) -> Result<(L4Proto, u16, u16, usize), DecodeError> {
    if frame.len() < offset + 8 {
        return Err(DecodeError::Malformed("icmpv6 header truncated"));
    }
    let b = &frame[offset..];
    let icmp_type = b[0];
    let code = b[1];
    let type_code = u16::from_be_bytes([icmp_type, code]);
    let l4_offset = offset + 8;

    if icmp_type == ICMPV6_ECHO_REQUEST || icmp_type == ICMPV6_ECHO_REPLY {
        let identifier = u16::from_be_bytes([b[4], b[5]]);
        Ok((L4Proto::Icmpv6, type_code, identifier, l4_offset))
    } else {
        Ok((L4Proto::Icmpv6, 0, 0, l4_offset))
    }
}
