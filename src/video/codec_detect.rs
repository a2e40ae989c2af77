//! Codec classification from the first bytes of an RTP payload (§4.8).
//!
//! H.264 and H.265 NAL headers overlap in the nibbles a naive reader would
//! check first, so the checks below run in the order the spec prescribes:
//! packetization-specific markers first, then H.265's VPS/SPS/PPS range
//! (which would otherwise be misread as an H.264 slice), then the two
//! single-NAL heuristics last.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    H264,
    H265,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalClass {
    /// An RTP fragment/aggregation packet — not a single complete NAL.
    Packetized,
    /// A single complete NAL unit of the given type.
    SingleNal(u8),
}

/// Classify the codec of one RTP payload from its leading NAL header byte(s).
pub fn classify(payload: &[u8]) -> Option<CodecKind> {
    if payload.is_empty() {
        return None;
    }
    let b0 = payload[0];

    // 1. H.264 FU-A (28) or STAP-A (24): nal_unit_type is the low 5 bits.
    let h264_type = b0 & 0x1F;
    if h264_type == 28 || h264_type == 24 {
        return Some(CodecKind::H264);
    }

    // 2. H.265 AP (48) or FU (49): two-byte header, type in bits 1-6.
    if payload.len() >= 2 {
        let h265_type = (b0 >> 1) & 0x3F;
        if h265_type == 48 || h265_type == 49 {
            return Some(CodecKind::H265);
        }

        // 3. H.265 VPS(32)/SPS(33)/PPS(34) range, checked before the H.264
        // single-NAL fallback below (otherwise e.g. 0x42 0x01 — an H.265
        // SPS — would be misread as H.264 nal_unit_type 2).
        if (32..=40).contains(&h265_type) {
            return Some(CodecKind::H265);
        }
    }

    // 4. H.264 single-NAL 1..23: cross-check nal_ref_idc consistency —
    // IDR (type 5) must carry a nonzero ref_idc, non-reference types
    // (6 SEI, 9 AUD, 10-12) must carry ref_idc == 0.
    if (1..=23).contains(&h264_type) {
        let nal_ref_idc = (b0 >> 5) & 0x03;
        let consistent = match h264_type {
            5 => nal_ref_idc != 0,
            6 | 9 | 10 | 11 | 12 => nal_ref_idc == 0,
            _ => true,
        };
        if consistent {
            return Some(CodecKind::H264);
        }
    }

    // 5. H.265 VCL 0..31: require temporal_id_plus1 in 1..7 and layer_id=0.
    if payload.len() >= 2 {
        let h265_type = (b0 >> 1) & 0x3F;
        if h265_type <= 31 {
            let layer_id = ((b0 & 0x01) << 5) | (payload[1] >> 3);
            let temporal_id_plus1 = payload[1] & 0x07;
            if layer_id == 0 && (1..=7).contains(&temporal_id_plus1) {
                return Some(CodecKind::H265);
            }
        }
    }

    None
}

/// H.264 type 5 (IDR) or its FU-A start-fragment; H.265 types 19/20
/// (IDR_W_RADL / IDR_N_LP) or their FU start-fragment (§4.8/§4.9).
///
/// FU-A reassembly is intentionally not performed: a dropped start
/// fragment yields a missed keyframe, matching the spec's decision to
/// preserve that behavior of the original rather than reassemble.
pub fn is_keyframe_start(codec: CodecKind, payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let b0 = payload[0];
    match codec {
        CodecKind::H264 => {
            let nal_type = b0 & 0x1F;
            if nal_type == 5 {
                return true;
            }
            if nal_type == 28 && payload.len() >= 2 {
                let fu_header = payload[1];
                let start_bit = fu_header & 0x80 != 0;
                let fu_type = fu_header & 0x1F;
                return start_bit && fu_type == 5;
            }
            false
        }
        CodecKind::H265 => {
            if payload.len() < 2 {
                return false;
            }
            let nal_type = (b0 >> 1) & 0x3F;
            if nal_type == 19 || nal_type == 20 {
                return true;
            }
            if nal_type == 49 && payload.len() >= 3 {
                let fu_header = payload[2];
                let start_bit = fu_header & 0x80 != 0;
                let fu_type = fu_header & 0x3F;
                return start_bit && (fu_type == 19 || fu_type == 20);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_fu_a_detected_by_packetization() {
        assert_eq!(classify(&[28, 0x05]), Some(CodecKind::H264));
    }

    #[test]
    fn h265_sps_not_misread_as_h264_slice() {
        // 0x42 0x01: H.264 would read nal_unit_type = 0x42 & 0x1F = 2
        // (non-IDR slice), but this is an H.265 SPS (type 33).
        assert_eq!(classify(&[0x42, 0x01]), Some(CodecKind::H265));
    }

    #[test]
    fn h264_idr_requires_nonzero_ref_idc() {
        // type=5 (IDR), ref_idc=3 -> consistent.
        assert_eq!(classify(&[0b011_00101]), Some(CodecKind::H264));
    }

    #[test]
    fn h265_vcl_used_when_h264_interpretation_is_inconsistent() {
        // b0 = 0x26: as H.264 this is SEI (type 6) with ref_idc=1, which
        // is an inconsistent combination (SEI must carry ref_idc 0) and
        // falls through; as H.265 it's a valid VCL NAL (type 19, layer_id
        // 0, temporal_id_plus1 1).
        assert_eq!(classify(&[0x26, 0x01]), Some(CodecKind::H265));
    }

    #[test]
    fn h264_fu_a_start_fragment_is_keyframe_start() {
        let payload = [28u8, 0x85]; // start bit set, fu_type=5 (IDR)
        assert!(is_keyframe_start(CodecKind::H264, &payload));
    }
}
