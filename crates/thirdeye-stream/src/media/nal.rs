//! # NAL Unit Parser
//!
//! Start-code scanning and header classification for H.264 (AVC) Annex-B
//! byte streams.
//!
//! The H.264 NAL header is 1 byte: `forbidden(1) | nal_ref_idc(2) | nal_type(5)`.

use bytes::{BufMut, Bytes, BytesMut};

/// Annex-B start code, long form.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Coded slice of a non-IDR picture (P/B slice).
pub const NAL_SLICE: u8 = 1;
/// Coded slice of an IDR picture.
pub const NAL_IDR: u8 = 5;
/// Supplemental enhancement information.
pub const NAL_SEI: u8 = 6;
/// Sequence parameter set.
pub const NAL_SPS: u8 = 7;
/// Picture parameter set.
pub const NAL_PPS: u8 = 8;
/// Access unit delimiter.
pub const NAL_AUD: u8 = 9;

/// One NAL unit with its start code stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    /// Header byte plus RBSP, no start code.
    pub payload: Bytes,
    /// Low 5 bits of the header byte.
    pub nal_type: u8,
    /// Whether this unit is an IDR slice.
    pub is_keyframe: bool,
}

impl NalUnit {
    /// Classify a start-code-stripped payload.
    ///
    /// Returns `None` for an empty payload. Any header value is accepted;
    /// semantic validity of the stream is not checked here.
    pub fn parse(payload: Bytes) -> Option<Self> {
        let header = *payload.first()?;
        let nal_type = nal_type_of(header);
        Some(NalUnit {
            payload,
            nal_type,
            is_keyframe: nal_type == NAL_IDR,
        })
    }
}

/// Extract the NAL unit type from a header byte.
#[inline]
pub fn nal_type_of(header: u8) -> u8 {
    header & 0x1F
}

/// Whether `nal_type` carries coded picture data (VCL NAL units 1..=5).
#[inline]
pub fn is_vcl(nal_type: u8) -> bool {
    (1..=5).contains(&nal_type)
}

/// Short human-readable name for log lines.
pub fn type_name(nal_type: u8) -> &'static str {
    match nal_type {
        NAL_SLICE => "slice",
        2..=4 => "slice-partition",
        NAL_IDR => "idr",
        NAL_SEI => "sei",
        NAL_SPS => "sps",
        NAL_PPS => "pps",
        NAL_AUD => "aud",
        10 => "end-of-seq",
        11 => "end-of-stream",
        12 => "filler",
        13 => "sps-ext",
        _ => "other",
    }
}

/// A start code located inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCode {
    /// Index of the first byte of the start code (the extra `00` for the
    /// 4-byte form).
    pub head: usize,
    /// 3 or 4.
    pub len: usize,
}

impl StartCode {
    /// Index of the first payload byte after the start code.
    #[inline]
    pub fn end(&self) -> usize {
        self.head + self.len
    }
}

/// Find the next `00 00 01` at or after `from`.
///
/// A `00` immediately before the pattern promotes the match to the 4-byte
/// form. `from` is the index where the `00 00 01` pattern itself may start;
/// the lookbehind byte may lie before it.
pub fn find_start_code(buf: &[u8], from: usize) -> Option<StartCode> {
    let mut i = from;
    while i + 2 < buf.len() {
        // Skip quickly: a start code needs buf[i + 2] == 1 and buf[i + 1] == 0.
        if buf[i + 2] > 1 {
            i += 3;
            continue;
        }
        if buf[i] == 0x00 && buf[i + 1] == 0x00 && buf[i + 2] == 0x01 {
            return Some(if i > 0 && buf[i - 1] == 0x00 {
                StartCode { head: i - 1, len: 4 }
            } else {
                StartCode { head: i, len: 3 }
            });
        }
        i += 1;
    }
    None
}

/// Copy `payload` behind a 4-byte start code.
pub fn with_start_code(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(START_CODE.len() + payload.len());
    out.put_slice(&START_CODE);
    out.put_slice(payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_sps() {
        let nal = NalUnit::parse(Bytes::from_static(&[0x67, 0x42])).unwrap();
        assert_eq!(nal.nal_type, NAL_SPS);
        assert!(!nal.is_keyframe);
    }

    #[test]
    fn h264_pps() {
        let nal = NalUnit::parse(Bytes::from_static(&[0x68, 0xCE])).unwrap();
        assert_eq!(nal.nal_type, NAL_PPS);
    }

    #[test]
    fn h264_idr_is_keyframe() {
        let nal = NalUnit::parse(Bytes::from_static(&[0x65, 0x88])).unwrap();
        assert_eq!(nal.nal_type, NAL_IDR);
        assert!(nal.is_keyframe);
    }

    #[test]
    fn h264_p_slice() {
        // forbidden=0, ref_idc=2, type=1
        let nal = NalUnit::parse(Bytes::from_static(&[0x41, 0x9A])).unwrap();
        assert_eq!(nal.nal_type, NAL_SLICE);
        assert!(!nal.is_keyframe);
    }

    #[test]
    fn out_of_range_types_still_parse() {
        // forbidden bit set, type 31: not valid H.264 but still a unit.
        let nal = NalUnit::parse(Bytes::from_static(&[0xFF])).unwrap();
        assert_eq!(nal.nal_type, 31);
        assert_eq!(type_name(31), "other");
    }

    #[test]
    fn empty_payload() {
        assert!(NalUnit::parse(Bytes::new()).is_none());
    }

    #[test]
    fn vcl_range() {
        assert!(is_vcl(NAL_SLICE));
        assert!(is_vcl(NAL_IDR));
        assert!(!is_vcl(NAL_SPS));
        assert!(!is_vcl(NAL_AUD));
        assert!(!is_vcl(0));
    }

    // ─── Start Codes ────────────────────────────────────────────────────

    #[test]
    fn finds_three_byte_start_code() {
        let data = [0xAA, 0x00, 0x00, 0x01, 0x67];
        let sc = find_start_code(&data, 0).unwrap();
        assert_eq!(sc, StartCode { head: 1, len: 3 });
        assert_eq!(sc.end(), 4);
    }

    #[test]
    fn finds_four_byte_start_code() {
        let data = [0x00, 0x00, 0x00, 0x01, 0x67];
        let sc = find_start_code(&data, 0).unwrap();
        assert_eq!(sc, StartCode { head: 0, len: 4 });
    }

    #[test]
    fn four_byte_form_detected_when_scan_starts_past_lookbehind() {
        let data = [0x00, 0x00, 0x00, 0x01, 0x67];
        let sc = find_start_code(&data, 1).unwrap();
        assert_eq!(sc, StartCode { head: 0, len: 4 });
    }

    #[test]
    fn respects_from_offset() {
        let data = [0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x01, 0x68];
        let first = find_start_code(&data, 0).unwrap();
        assert_eq!(first.head, 0);
        let second = find_start_code(&data, first.end()).unwrap();
        assert_eq!(second, StartCode { head: 4, len: 3 });
    }

    #[test]
    fn no_start_code() {
        assert!(find_start_code(&[], 0).is_none());
        assert!(find_start_code(&[0x00, 0x00], 0).is_none());
        assert!(find_start_code(&[0x00, 0x00, 0x02, 0x01, 0x00], 0).is_none());
    }

    #[test]
    fn with_start_code_prefixes_long_form() {
        let out = with_start_code(&[0x67, 0x42]);
        assert_eq!(&out[..], &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
    }
}
