//! Feeds a small synthetic capture (a TCP handshake plus a short H.264 RTP
//! video stream) through [`Engine`] and prints the resulting snapshots.
//!
//! Run with `cargo run --example replay`.

use std::sync::Mutex;

use flowlens_core::{CaptureError, CaptureSource, Engine, EngineConfig, LinkType, RawPacket, Timestamp};

const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
const SRC_IP: [u8; 4] = [10, 0, 0, 1];
const DST_IP: [u8; 4] = [10, 0, 0, 2];

fn ethernet_ipv4_header(total_len: u16, proto: u8, payload_len: u16) -> Vec<u8> {
    let mut f = Vec::with_capacity(14 + 20);
    f.extend_from_slice(&DST_MAC);
    f.extend_from_slice(&SRC_MAC);
    f.extend_from_slice(&0x0800u16.to_be_bytes());
    f.push(0x45); // version 4, IHL 5
    f.push(0x00); // DSCP/ECN
    f.extend_from_slice(&total_len.to_be_bytes());
    f.extend_from_slice(&[0x00, 0x00]); // identification
    f.extend_from_slice(&[0x00, 0x00]); // flags/fragment offset
    f.push(64); // TTL
    f.push(proto);
    f.extend_from_slice(&[0x00, 0x00]); // checksum, unchecked by the decoder
    f.extend_from_slice(&SRC_IP);
    f.extend_from_slice(&DST_IP);
    let _ = payload_len;
    f
}

fn tcp_frame(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let tcp_len = 20 + payload.len();
    let mut f = ethernet_ipv4_header((20 + tcp_len) as u16, 6, tcp_len as u16);
    f.extend_from_slice(&src_port.to_be_bytes());
    f.extend_from_slice(&dst_port.to_be_bytes());
    f.extend_from_slice(&seq.to_be_bytes());
    f.extend_from_slice(&ack.to_be_bytes());
    f.push(5 << 4); // data offset, no options
    f.push(flags);
    f.extend_from_slice(&65535u16.to_be_bytes()); // window
    f.extend_from_slice(&[0x00, 0x00]); // checksum
    f.extend_from_slice(&[0x00, 0x00]); // urgent pointer
    f.extend_from_slice(payload);
    f
}

fn udp_rtp_frame(src_port: u16, dst_port: u16, ssrc: u32, seq: u16, rtp_ts: u32, payload_type: u8, nal: &[u8]) -> Vec<u8> {
    let mut rtp = Vec::with_capacity(12 + nal.len());
    rtp.push(0x80); // version 2, no padding/extension/csrc
    rtp.push(payload_type & 0x7F);
    rtp.extend_from_slice(&seq.to_be_bytes());
    rtp.extend_from_slice(&rtp_ts.to_be_bytes());
    rtp.extend_from_slice(&ssrc.to_be_bytes());
    rtp.extend_from_slice(nal);

    let udp_len = 8 + rtp.len();
    let mut f = ethernet_ipv4_header((20 + udp_len) as u16, 17, udp_len as u16);
    f.extend_from_slice(&src_port.to_be_bytes());
    f.extend_from_slice(&dst_port.to_be_bytes());
    f.extend_from_slice(&(udp_len as u16).to_be_bytes());
    f.extend_from_slice(&[0x00, 0x00]); // checksum
    f.extend_from_slice(&rtp);
    f
}

/// Replays a fixed script of packets, one per call to `next_packet`, then
/// reports the capture as closed — the same shape a finite pcap read loop
/// would have.
struct ScriptedReplay {
    packets: Mutex<Vec<RawPacket>>,
}

impl ScriptedReplay {
    fn new() -> Self {
        let mut packets = Vec::new();
        let mut t = Timestamp::new(1_700_000_000, 0);
        let mut push = |bytes: Vec<u8>, t: Timestamp| {
            packets.push(RawPacket {
                timestamp: t,
                original_len: bytes.len() as u32,
                captured_len: bytes.len() as u32,
                bytes,
                link_type: LinkType::Ethernet,
            });
        };

        // TCP handshake plus one data segment, port 443.
        push(tcp_frame(51000, 443, 1000, 0, 0x02, &[]), t); // SYN
        t = t.add_micros(1_000);
        push(tcp_frame(443, 51000, 5000, 1001, 0x12, &[]), t); // SYN-ACK
        t = t.add_micros(1_000);
        push(tcp_frame(51000, 443, 1001, 5001, 0x10, &[]), t); // ACK
        t = t.add_micros(5_000);
        push(tcp_frame(51000, 443, 1001, 5001, 0x18, b"GET / HTTP/1.1\r\n\r\n"), t); // PSH+ACK

        // A short H.264 RTP video stream: one IDR keyframe NAL followed by
        // a few non-reference slices, port 5004.
        t = t.add_micros(33_000);
        push(
            udp_rtp_frame(40000, 5004, 0xCAFEBABE, 1, 3000, 96, &[0x65, 0x88, 0x84, 0x00]), // IDR, ref_idc=3
            t,
        );
        for i in 0..3u16 {
            t = t.add_micros(33_000);
            push(
                udp_rtp_frame(40000, 5004, 0xCAFEBABE, 2 + i, 3000 + (i as u32 + 1) * 3000, 96, &[0x41, 0x9a]),
                t,
            );
        }

        Self {
            packets: Mutex::new(packets),
        }
    }
}

impl CaptureSource for ScriptedReplay {
    fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        let mut packets = self.packets.lock().unwrap();
        if packets.is_empty() {
            return Err(CaptureError::Closed);
        }
        Ok(Some(packets.remove(0)))
    }
}

fn main() {
    env_logger::init();

    let config = EngineConfig {
        request_realtime_priority: false,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, ScriptedReplay::new()).expect("valid engine config");
    engine.start().expect("engine starts exactly once");

    // Give the writer thread a few ticks to drain the script and publish a
    // snapshot before the capture source reports closed.
    std::thread::sleep(std::time::Duration::from_millis(50));

    let snap = engine.snapshot();
    println!("flows observed: {}", snap.flow_count);
    for flow in &snap.flows {
        println!(
            "  {:?} bytes={} packets={} tcp={:?} video_streams={}",
            flow.key,
            flow.total_bytes,
            flow.total_packets,
            flow.tcp.as_ref().map(|t| t.state),
            flow.video.len()
        );
    }
    println!("stats: {:?}", engine.stats());

    engine.stop();
}
