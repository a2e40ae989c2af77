//! Per-TCP-connection RTT (§4.6) and window/congestion tracking (§4.7),
//! both keyed by `CanonicalKey` so either direction of a connection lands
//! on the same entry.

pub mod rtt;
pub mod window;

pub use rtt::{RttTracker, TcpRttEntry};
pub use window::{ScaleStatus, TcpWindowEntry, WindowTracker};

/// Connection lifecycle state, shared between the RTT and window trackers
/// since both observe the same TCP byte stream (§3 `TcpRttEntry::state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Unknown,
    SynSeen,
    Active,
    FinWait,
    Closed,
}

impl ConnState {
    /// Advance the state machine given one packet's TCP flags (§4.6). RST
    /// always forces `Closed` regardless of the current state.
    pub fn advance(self, syn: bool, ack: bool, fin: bool, rst: bool, has_payload: bool) -> Self {
        if rst {
            return ConnState::Closed;
        }
        match self {
            ConnState::Unknown if syn => ConnState::SynSeen,
            ConnState::SynSeen if has_payload || ack => ConnState::Active,
            ConnState::Active if fin => ConnState::FinWait,
            ConnState::FinWait if fin && ack => ConnState::Closed,
            other => other,
        }
    }
}

/// One packet's relevant TCP header fields, shared input to both trackers.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub seq: u32,
    pub ack: u32,
    pub window_raw: u16,
    pub payload_len: u32,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    pub ece: bool,
    pub cwr: bool,
    /// Window-scale option value, present only when this is a SYN or SYN-ACK.
    pub window_scale_opt: Option<u8>,
}

const WINDOW_SCALE_OPTION_KIND: u8 = 3;
const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;

/// Re-parse one TCP segment's fields from `frame` at `header_offset` (§4.1
/// decode already consumed this header once to find the payload start;
/// the RTT/window trackers need the flags/seq/ack/window it didn't keep).
/// Returns `None` on a header too short to hold the fixed 20 bytes —
/// the decoder already rejected that frame as malformed before this is
/// ever called, so this is a belt-and-suspenders bounds check only.
pub fn parse_segment(frame: &[u8], header_offset: usize, payload_offset: usize) -> Option<TcpSegment> {
    if frame.len() < header_offset + 20 {
        return None;
    }
    let b = &frame[header_offset..];
    let seq = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
    let ack = u32::from_be_bytes([b[8], b[9], b[10], b[11]]);
    let data_offset = (b[12] >> 4) as usize;
    let flags = b[13];
    let window_raw = u16::from_be_bytes([b[14], b[15]]);
    let syn = flags & 0x02 != 0;
    let ack_flag = flags & 0x10 != 0;
    let fin = flags & 0x01 != 0;
    let rst = flags & 0x04 != 0;
    let ece = flags & 0x40 != 0;
    let cwr = flags & 0x80 != 0;

    let mut window_scale_opt = None;
    if syn {
        let options_start = header_offset + 20;
        let options_end = (header_offset + data_offset * 4).min(frame.len());
        window_scale_opt = parse_window_scale_option(&frame[options_start.min(options_end)..options_end]);
    }

    Some(TcpSegment {
        seq,
        ack,
        window_raw,
        payload_len: frame.len().saturating_sub(payload_offset) as u32,
        syn,
        ack_flag,
        fin,
        rst,
        ece,
        cwr,
        window_scale_opt,
    })
}

fn parse_window_scale_option(options: &[u8]) -> Option<u8> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            OPTION_END => break,
            OPTION_NOP => i += 1,
            WINDOW_SCALE_OPTION_KIND => {
                if i + 2 < options.len() {
                    return Some(options[i + 2]);
                }
                break;
            }
            kind => {
                if i + 1 >= options.len() {
                    break;
                }
                let len = options[i + 1] as usize;
                if len < 2 {
                    break;
                }
                let _ = kind;
                i += len;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rst_forces_closed_from_any_state() {
        for state in [
            ConnState::Unknown,
            ConnState::SynSeen,
            ConnState::Active,
            ConnState::FinWait,
        ] {
            assert_eq!(
                state.advance(false, false, false, true, false),
                ConnState::Closed
            );
        }
    }

    #[test]
    fn syn_seen_to_active_on_data_or_ack() {
        assert_eq!(
            ConnState::SynSeen.advance(false, false, false, false, true),
            ConnState::Active
        );
        assert_eq!(
            ConnState::SynSeen.advance(false, true, false, false, false),
            ConnState::Active
        );
    }

    fn syn_frame_with_window_scale(scale: u8) -> Vec<u8> {
        // 20-byte fixed header + 3-byte window-scale option, padded to a
        // 4-byte boundary (data_offset = 6).
        let mut f = vec![0u8; 24];
        f[4..8].copy_from_slice(&100u32.to_be_bytes());
        f[8..12].copy_from_slice(&0u32.to_be_bytes());
        f[12] = 6 << 4;
        f[13] = 0x02; // SYN
        f[14..16].copy_from_slice(&65535u16.to_be_bytes());
        f[20] = WINDOW_SCALE_OPTION_KIND;
        f[21] = 3;
        f[22] = scale;
        f[23] = OPTION_NOP;
        f
    }

    #[test]
    fn parses_window_scale_off_syn() {
        let f = syn_frame_with_window_scale(7);
        let seg = parse_segment(&f, 0, 24).unwrap();
        assert!(seg.syn);
        assert_eq!(seg.window_scale_opt, Some(7));
        assert_eq!(seg.seq, 100);
        assert_eq!(seg.payload_len, 0);
    }

    #[test]
    fn non_syn_segment_has_no_window_scale() {
        let mut f = vec![0u8; 20];
        f[12] = 5 << 4;
        f[13] = 0x10; // ACK only
        f.extend_from_slice(&[1, 2, 3, 4]); // 4 bytes of payload
        let seg = parse_segment(&f, 0, 20).unwrap();
        assert!(!seg.syn);
        assert!(seg.ack_flag);
        assert_eq!(seg.window_scale_opt, None);
        assert_eq!(seg.payload_len, 4);
    }
}
