//! Per-`(Flow, SSRC)` RTP stream metrics: RFC 3550 jitter, sequence-gap
//! loss/reorder/discontinuity, frame/GOP/keyframe detection, and a
//! 1-second windowed fps/bitrate/jitter accumulator (§4.9).

use std::collections::HashMap;

use crate::flow_key::FlowKey;
use crate::time::{log_scale_bucket_12, Timestamp};

use super::codec_detect::CodecKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSource {
    InBand,
    Sdp,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Sequence-gap classification against `expected = last_seq + 1 mod 2^16`
/// (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOutcome {
    InOrder,
    Loss(u32),
    Reorder,
    Discontinuity,
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowAccum {
    window_start: Option<Timestamp>,
    frames: u64,
    bytes: u64,
    jitter_sum: i64,
    jitter_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSnapshot {
    pub fps_x100: i64,
    pub bitrate_kbps: i64,
    pub mean_jitter_us: i64,
}

pub struct RtpStreamEntry {
    pub ssrc: u32,
    pub clock_rate: u32,

    last_seq: Option<u16>,
    first_rtp_ts: Option<u32>,
    last_rtp_ts: Option<u32>,
    pub first_arrival: Timestamp,
    pub last_arrival: Timestamp,

    jitter_x16: i64,

    pub packet_count: u64,
    pub loss_count: u64,
    pub reorder_count: u64,
    pub discontinuity_count: u64,

    codec: Option<CodecKind>,
    pub audio_codec: Option<u8>,
    pub payload_type: u8,
    pub codec_source: Option<CodecSource>,

    resolution: Option<Resolution>,
    profile: Option<u8>,
    level: Option<u8>,

    pub keyframe_count: u64,
    frame_count: u64,
    last_keyframe_frame_num: u64,
    pub last_gop_size: u64,

    prev_frame_ts: u32,
    prev_frame_ts_valid: bool,

    window: WindowAccum,
    pub last_window: WindowSnapshot,

    pub jitter_hist: [u32; 12],
}

impl RtpStreamEntry {
    fn new(ssrc: u32, clock_rate: u32, payload_type: u8, now: Timestamp) -> Self {
        Self {
            ssrc,
            clock_rate,
            last_seq: None,
            first_rtp_ts: None,
            last_rtp_ts: None,
            first_arrival: now,
            last_arrival: now,
            jitter_x16: 0,
            packet_count: 0,
            loss_count: 0,
            reorder_count: 0,
            discontinuity_count: 0,
            codec: None,
            audio_codec: None,
            payload_type,
            codec_source: None,
            resolution: None,
            profile: None,
            level: None,
            keyframe_count: 0,
            frame_count: 0,
            last_keyframe_frame_num: 0,
            last_gop_size: 0,
            prev_frame_ts: 0,
            prev_frame_ts_valid: false,
            window: WindowAccum::default(),
            last_window: WindowSnapshot::default(),
            jitter_hist: [0; 12],
        }
    }

    /// Jitter estimate per RFC 3550, stored scaled by 16 (`J`), exposed as
    /// the unscaled microsecond value.
    pub fn jitter_us(&self) -> i64 {
        self.jitter_x16 >> 4
    }

    /// First detected codec wins; later packets cannot override it
    /// (§4.9 sticky policy — NAL bytes are ambiguous enough that trusting
    /// each packet individually causes visible flicker).
    pub fn latch_codec(&mut self, codec: CodecKind) {
        if self.codec.is_none() {
            self.codec = Some(codec);
        }
    }

    pub fn codec(&self) -> Option<CodecKind> {
        self.codec
    }

    /// Write-once resolution/profile/level from the first SPS that
    /// produces sane values.
    pub fn latch_sps(&mut self, resolution: Resolution, profile: u8, level: u8) {
        if self.resolution.is_none() {
            self.resolution = Some(resolution);
            self.profile = Some(profile);
            self.level = Some(level);
        }
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    /// Overlay an out-of-band SDP hint (§6 inbound RTSP tap interface).
    /// Unlike [`Self::latch_sps`], this always overwrites: the tap is an
    /// authoritative external source, not a second in-band guess.
    pub fn apply_sdp_hint(&mut self, resolution: Resolution, profile: u8, level: u8) {
        self.resolution = Some(resolution);
        self.profile = Some(profile);
        self.level = Some(level);
        self.codec_source = Some(CodecSource::Sdp);
    }

    fn classify_seq(&mut self, seq: u16) -> SeqOutcome {
        let Some(last) = self.last_seq else {
            return SeqOutcome::InOrder;
        };
        let expected = last.wrapping_add(1);
        if seq == expected {
            return SeqOutcome::InOrder;
        }
        let gap = (seq.wrapping_sub(expected)) as i32;
        // A positive gap below 1000 is that many lost packets; a small
        // negative gap (closer than -100) is reordering, not loss;
        // anything wider is one discontinuity event.
        let signed_gap = if gap > 32768 { gap - 65536 } else { gap };
        if signed_gap > 0 && signed_gap < 1000 {
            SeqOutcome::Loss(signed_gap as u32)
        } else if signed_gap < 0 && signed_gap > -100 {
            SeqOutcome::Reorder
        } else {
            SeqOutcome::Discontinuity
        }
    }

    fn record_jitter(&mut self, now: Timestamp, rtp_ts: u32) {
        if let (Some(last_arrival_ts), Some(last_rtp_ts)) = (Some(self.last_arrival), self.last_rtp_ts) {
            if self.packet_count > 0 {
                let delta_arrival_us = now.diff_micros(last_arrival_ts);
                let delta_arrival_ts =
                    (delta_arrival_us as i64) * self.clock_rate as i64 / 1_000_000;
                let delta_rtp_ts = rtp_ts.wrapping_sub(last_rtp_ts) as i32 as i64;
                let d = (delta_arrival_ts - delta_rtp_ts).abs();
                self.jitter_x16 += d - (self.jitter_x16 >> 4);
                self.jitter_hist[log_scale_bucket_12(self.jitter_us())] += 1;
            }
        }
    }

    fn record_frame_boundary(&mut self, rtp_ts: u32, is_keyframe_start: bool) -> bool {
        let is_new_frame = !self.prev_frame_ts_valid || rtp_ts != self.prev_frame_ts;
        if is_new_frame {
            self.frame_count += 1;
            self.prev_frame_ts = rtp_ts;
            self.prev_frame_ts_valid = true;
            if is_keyframe_start {
                self.keyframe_count += 1;
                self.last_gop_size = self.frame_count - self.last_keyframe_frame_num;
                self.last_keyframe_frame_num = self.frame_count;
            }
        }
        is_new_frame
    }

    fn record_window(&mut self, now: Timestamp, bytes: u32, is_new_frame: bool) {
        let window_start = *self.window.window_start.get_or_insert(now);
        if is_new_frame {
            self.window.frames += 1;
        }
        self.window.bytes += bytes as u64;
        if self.packet_count > 0 {
            self.window.jitter_sum += self.jitter_us();
            self.window.jitter_count += 1;
        }

        let window_us = now.diff_micros(window_start);
        if window_us >= 1_000_000 {
            self.last_window = WindowSnapshot {
                fps_x100: self.window.frames as i64 * 100_000_000 / window_us.max(1),
                bitrate_kbps: self.window.bytes as i64 * 8000 / window_us.max(1),
                mean_jitter_us: if self.window.jitter_count > 0 {
                    self.window.jitter_sum / self.window.jitter_count as i64
                } else {
                    0
                },
            };
            self.window = WindowAccum::default();
        }
    }

    /// Fold one RTP packet's arrival into the stream's state. Returns the
    /// sequence-gap classification for callers that want to surface it.
    pub fn record_packet(
        &mut self,
        now: Timestamp,
        seq: u16,
        rtp_ts: u32,
        bytes: u32,
        is_keyframe_start: bool,
    ) -> SeqOutcome {
        let outcome = self.classify_seq(seq);
        match outcome {
            SeqOutcome::Loss(n) => self.loss_count += n as u64,
            SeqOutcome::Reorder => self.reorder_count += 1,
            SeqOutcome::Discontinuity => self.discontinuity_count += 1,
            SeqOutcome::InOrder => {}
        }

        self.record_jitter(now, rtp_ts);

        if self.first_rtp_ts.is_none() {
            self.first_rtp_ts = Some(rtp_ts);
        }
        let is_new_frame = self.record_frame_boundary(rtp_ts, is_keyframe_start);
        self.record_window(now, bytes, is_new_frame);

        self.last_seq = Some(seq);
        self.last_rtp_ts = Some(rtp_ts);
        self.last_arrival = now;
        self.packet_count += 1;

        outcome
    }
}

/// Owns every live `(FlowKey, SSRC)` stream, and the 90 kHz-for-video /
/// 8 kHz-or-48 kHz-for-audio clock rate convention (§3).
#[derive(Default)]
pub struct VideoMetricsTracker {
    streams: HashMap<(FlowKey, u32), RtpStreamEntry>,
}

impl VideoMetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flow: &FlowKey, ssrc: u32) -> Option<&RtpStreamEntry> {
        self.streams.get(&(*flow, ssrc))
    }

    pub fn get_mut(&mut self, flow: &FlowKey, ssrc: u32) -> Option<&mut RtpStreamEntry> {
        self.streams.get_mut(&(*flow, ssrc))
    }

    /// Every live stream sharing a 5-tuple, regardless of SSRC — a flow can
    /// carry more than one SSRC when a source restarts mid-capture.
    pub fn streams_for<'a>(&'a self, flow: &'a FlowKey) -> impl Iterator<Item = &'a RtpStreamEntry> {
        self.streams
            .iter()
            .filter(move |((f, _), _)| f == flow)
            .map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn get_or_insert(
        &mut self,
        flow: FlowKey,
        ssrc: u32,
        clock_rate: u32,
        payload_type: u8,
        now: Timestamp,
    ) -> &mut RtpStreamEntry {
        self.streams
            .entry((flow, ssrc))
            .or_insert_with(|| RtpStreamEntry::new(ssrc, clock_rate, payload_type, now))
    }

    pub fn expire_before(&mut self, cutoff: Timestamp) {
        self.streams.retain(|_, e| e.last_arrival >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn flow() -> FlowKey {
        use crate::flow_key::{FlowAddrs, L4Proto};
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

    #[test]
    fn new_ssrc_starts_jitter_at_zero() {
        let mut t = VideoMetricsTracker::new();
        let f = flow();
        let e = t.get_or_insert(f, 111, 90_000, 96, Timestamp::new(0, 0));
        assert_eq!(e.jitter_us(), 0);
        e.record_packet(Timestamp::new(0, 0), 1, 1000, 100, false);
        assert_eq!(e.jitter_us(), 0);

        // A different SSRC is an entirely new entry with jitter at 0.
        let e2 = t.get_or_insert(f, 222, 90_000, 96, Timestamp::new(0, 0));
        assert_eq!(e2.jitter_us(), 0);
    }

    #[test]
    fn shared_timestamp_packets_are_one_frame() {
        let mut t = VideoMetricsTracker::new();
        let f = flow();
        let e = t.get_or_insert(f, 111, 90_000, 96, Timestamp::new(0, 0));
        e.record_packet(Timestamp::new(0, 0), 1, 1000, 100, false);
        e.record_packet(Timestamp::new(0, 1_000), 2, 1000, 100, false);
        assert_eq!(e.frame_count, 1);
        e.record_packet(Timestamp::new(0, 2_000), 3, 2000, 100, false);
        assert_eq!(e.frame_count, 2);
    }

    #[test]
    fn sequence_gap_under_1000_counts_as_loss() {
        let mut t = VideoMetricsTracker::new();
        let f = flow();
        let e = t.get_or_insert(f, 111, 90_000, 96, Timestamp::new(0, 0));
        e.record_packet(Timestamp::new(0, 0), 10, 1000, 100, false);
        let outcome = e.record_packet(Timestamp::new(0, 1_000), 15, 1100, 100, false);
        assert_eq!(outcome, SeqOutcome::Loss(4));
        assert_eq!(e.loss_count, 4);
    }

    #[test]
    fn small_negative_gap_is_reorder_not_loss() {
        let mut t = VideoMetricsTracker::new();
        let f = flow();
        let e = t.get_or_insert(f, 111, 90_000, 96, Timestamp::new(0, 0));
        e.record_packet(Timestamp::new(0, 0), 100, 1000, 100, false);
        let outcome = e.record_packet(Timestamp::new(0, 1_000), 99, 1000, 100, false);
        assert_eq!(outcome, SeqOutcome::Reorder);
    }

    #[test]
    fn codec_is_sticky_after_first_detection() {
        let mut t = VideoMetricsTracker::new();
        let f = flow();
        let e = t.get_or_insert(f, 111, 90_000, 96, Timestamp::new(0, 0));
        e.latch_codec(CodecKind::H264);
        e.latch_codec(CodecKind::H265);
        assert_eq!(e.codec(), Some(CodecKind::H264));
    }
}
