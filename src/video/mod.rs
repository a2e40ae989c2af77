//! Video detect (§4.8) and metrics (§4.9), tied together: given one UDP
//! datagram, decide whether it's RTP carrying video/audio or an MPEG-TS
//! payload, classify the codec, and fold the observation into the
//! per-`(Flow, SSRC)` metrics tracker.

pub mod codec_detect;
pub mod metrics;
pub mod mpegts;
pub mod rtp;
pub mod sps;

use crate::flow_key::FlowKey;
use crate::time::Timestamp;

pub use codec_detect::CodecKind;
pub use metrics::{CodecSource, Resolution, RtpStreamEntry, SeqOutcome, VideoMetricsTracker};

const VIDEO_CLOCK_RATE_HZ: u32 = 90_000;
/// Default audio clock rate for payload types without an explicit rate in
/// the static RTP profile table — most deployed PCMU/PCMA streams really
/// are 8 kHz; anything not recognized falls back to this rather than video's
/// 90 kHz, which would badly distort a jitter calculation.
const DEFAULT_AUDIO_CLOCK_RATE_HZ: u32 = 8_000;
const WIDEBAND_AUDIO_CLOCK_RATE_HZ: u32 = 48_000;

fn clock_rate_for(payload_type: u8, is_video: bool) -> u32 {
    if is_video {
        return VIDEO_CLOCK_RATE_HZ;
    }
    match payload_type {
        // Opus and other wideband dynamic payloads are commonly run at
        // 48 kHz; static PT 9 (G.722) is nominally 8 kHz timestamp-wise
        // despite 16 kHz sampling, so it's excluded here.
        96..=127 => WIDEBAND_AUDIO_CLOCK_RATE_HZ,
        _ => DEFAULT_AUDIO_CLOCK_RATE_HZ,
    }
}

/// Outcome of inspecting one UDP payload for video/audio RTP content.
#[derive(Debug, Clone, Copy)]
pub struct VideoObservation {
    pub ssrc: u32,
    pub is_video: bool,
    pub codec: Option<CodecKind>,
    pub seq_outcome: SeqOutcome,
}

/// Attempt to parse `payload` as RTP and fold it into `tracker`'s state for
/// `(flow, ssrc)`. Returns `None` if this isn't RTP we accept (bad version,
/// disallowed payload type, malformed header) — never an error, per §7
/// Lookup/NotFound-style "not available" semantics for anything that isn't
/// a hard decode failure elsewhere in the pipeline.
pub fn observe_rtp_packet(
    tracker: &mut VideoMetricsTracker,
    flow: FlowKey,
    payload: &[u8],
    now: Timestamp,
) -> Option<VideoObservation> {
    let header = rtp::parse(payload).ok()?;
    let is_video = rtp::is_video_payload_type(header.payload_type);
    let is_audio = rtp::is_audio_only_payload_type(header.payload_type);
    if !is_video && !is_audio {
        return None;
    }

    let clock_rate = clock_rate_for(header.payload_type, is_video);
    let media_payload = payload.get(header.payload_offset..).unwrap_or(&[]);

    let entry = tracker.get_or_insert(flow, header.ssrc, clock_rate, header.payload_type, now);

    let mut codec = entry.codec();
    let mut is_keyframe_start = false;
    if is_video {
        if let Some(detected) = codec_detect::classify(media_payload) {
            entry.latch_codec(detected);
            codec = entry.codec();
        }
        if let Some(kind) = codec {
            is_keyframe_start = codec_detect::is_keyframe_start(kind, media_payload);
            if is_keyframe_start {
                if let Some(sps_info) = extract_sps_info(kind, media_payload) {
                    entry.latch_sps(sps_info.0, sps_info.1, sps_info.2);
                }
            }
        }
    } else {
        entry.audio_codec.get_or_insert(header.payload_type);
    }

    let seq_outcome = entry.record_packet(
        now,
        header.sequence,
        header.timestamp,
        payload.len() as u32,
        is_keyframe_start,
    );

    Some(VideoObservation {
        ssrc: header.ssrc,
        is_video,
        codec,
        seq_outcome,
    })
}

/// If `payload` is a keyframe-start NAL (single-NAL IDR only — FU-A/FU
/// start fragments don't carry a full SPS to parse), try to pull a SPS out
/// of it. Real streams put the SPS in its own NAL, not fused with the IDR
/// slice, so this mostly fires on STAP-A/AP aggregates; a bare IDR slice
/// simply yields `None` here and resolution stays unavailable until an SPS
/// NAL is actually seen.
fn extract_sps_info(codec: CodecKind, payload: &[u8]) -> Option<(Resolution, u8, u8)> {
    if payload.is_empty() {
        return None;
    }
    match codec {
        CodecKind::H264 => {
            let nal_type = payload[0] & 0x1F;
            if nal_type != 7 || payload.len() < 2 {
                return None;
            }
            let rbsp = sps::strip_emulation_prevention(&payload[1..]);
            let info = sps::parse_h264_sps(&rbsp)?;
            Some((
                Resolution {
                    width: info.width,
                    height: info.height,
                },
                info.profile_idc,
                info.level_idc,
            ))
        }
        CodecKind::H265 => {
            if payload.len() < 2 {
                return None;
            }
            let nal_type = (payload[0] >> 1) & 0x3F;
            if nal_type != 33 || payload.len() < 3 {
                return None;
            }
            let rbsp = sps::strip_emulation_prevention(&payload[2..]);
            let info = sps::parse_h265_sps(&rbsp)?;
            Some((
                Resolution {
                    width: info.width,
                    height: info.height,
                },
                info.profile_byte_with_tier(),
                info.level_idc,
            ))
        }
    }
}

/// Detect an MPEG-TS payload (§4.8) and return a best-effort codec guess
/// from the first PES packet found on the probable video PID. This is
/// diagnostic only — no per-(Flow,SSRC) metrics are derived from MPEG-TS
/// today, since RFC 3550 jitter/sequence math doesn't apply to TS framing.
pub fn detect_mpegts(payload: &[u8]) -> Option<u8> {
    if !mpegts::looks_like_mpegts(payload) {
        return None;
    }
    const TS_PACKET_LEN: usize = 188;
    let packets: Vec<&[u8]> = payload.chunks_exact(TS_PACKET_LEN).collect();
    let video_pid = mpegts::guess_video_pid(&packets)?;
    for packet in &packets {
        let header = mpegts::parse_ts_header(packet)?;
        if header.pid != video_pid {
            continue;
        }
        if let Some(stream_id) = mpegts::pes_stream_id(&packet[header.payload_offset..]) {
            return Some(stream_id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_key::{FlowAddrs, L4Proto};
    use std::net::Ipv4Addr;

    fn flow() -> FlowKey {
        FlowKey {
            addrs: FlowAddrs::V4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
            },
            src_port: 5000,
            dst_port: 5004,
            l4_proto: L4Proto::Udp,
            traffic_class: 0,
        }
    }

    fn rtp_packet(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 12];
        p[0] = 2 << 6;
        p[1] = pt;
        p[2..4].copy_from_slice(&seq.to_be_bytes());
        p[4..8].copy_from_slice(&ts.to_be_bytes());
        p[8..12].copy_from_slice(&ssrc.to_be_bytes());
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn observes_video_rtp_and_latches_codec() {
        let mut tracker = VideoMetricsTracker::new();
        let pkt = rtp_packet(96, 1, 1000, 111, &[28, 0x85]); // H.264 FU-A, IDR start
        let obs = observe_rtp_packet(&mut tracker, flow(), &pkt, Timestamp::new(0, 0)).unwrap();
        assert!(obs.is_video);
        assert_eq!(obs.codec, Some(CodecKind::H264));
    }

    #[test]
    fn audio_only_payload_type_is_not_video() {
        let mut tracker = VideoMetricsTracker::new();
        let pkt = rtp_packet(0, 1, 160, 111, &[0u8; 20]); // PCMU
        let obs = observe_rtp_packet(&mut tracker, flow(), &pkt, Timestamp::new(0, 0)).unwrap();
        assert!(!obs.is_video);
    }

    #[test]
    fn rejects_unrecognized_payload_type() {
        let mut tracker = VideoMetricsTracker::new();
        let pkt = rtp_packet(50, 1, 160, 111, &[0u8; 20]);
        assert!(observe_rtp_packet(&mut tracker, flow(), &pkt, Timestamp::new(0, 0)).is_none());
    }
}
