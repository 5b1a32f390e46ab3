//! Monitor-mode decoder: no pixels are decoded. Every coded slice becomes
//! one output buffer, rendered as a flat grey frame sized from the SPS.

use super::{DecoderError, DecoderOutput, OutputBuffer, VideoDecoder};
use crate::media::nal;
use crate::media::params::DecoderConfig;
use crate::surface::{OutputSurface, PixelFormat, VideoFormat, VideoFrame};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Size used when the SPS cannot be parsed.
pub const FALLBACK_DIMENSIONS: (u32, u32) = (320, 240);

const PLACEHOLDER_RGB: [u8; 3] = [50, 50, 50];

/// At most this many undrained outputs are kept.
const MAX_PENDING: usize = 16;

struct OpenState {
    surface: Arc<dyn OutputSurface>,
    format: VideoFormat,
    placeholder: Bytes,
    format_reported: bool,
}

#[derive(Default)]
pub struct NullDecoder {
    open: Option<OpenState>,
    pending: VecDeque<OutputBuffer>,
    next_index: usize,
}

impl NullDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output format once opened.
    pub fn format(&self) -> Option<VideoFormat> {
        self.open.as_ref().map(|o| o.format)
    }
}

impl VideoDecoder for NullDecoder {
    fn name(&self) -> &'static str {
        "null"
    }

    fn open(
        &mut self,
        config: &DecoderConfig,
        surface: Arc<dyn OutputSurface>,
    ) -> Result<(), DecoderError> {
        let (width, height) = config.dimensions().unwrap_or(FALLBACK_DIMENSIONS);
        let placeholder = VideoFrame::solid(width, height, PLACEHOLDER_RGB, 0)
            .ok_or_else(|| {
                DecoderError::Configure(format!("unsupported picture size {width}x{height}"))
            })?
            .data;
        debug!(width, height, codec = ?config.codec_string(), "null decoder opened");
        self.open = Some(OpenState {
            surface,
            format: VideoFormat {
                width,
                height,
                pixel_format: PixelFormat::Rgb24,
            },
            placeholder,
            format_reported: false,
        });
        self.pending.clear();
        Ok(())
    }

    fn queue_input(
        &mut self,
        nal_unit: &[u8],
        pts_us: u64,
        _timeout: Duration,
    ) -> Result<bool, DecoderError> {
        if self.open.is_none() {
            return Err(DecoderError::NotOpen);
        }
        let Some(&header) = nal_unit.first() else {
            return Ok(true);
        };
        if !nal::is_vcl(nal::nal_type_of(header)) {
            return Ok(true);
        }
        if self.pending.len() >= MAX_PENDING {
            return Ok(false);
        }
        self.pending.push_back(OutputBuffer {
            index: self.next_index,
            pts_us,
        });
        self.next_index = self.next_index.wrapping_add(1);
        Ok(true)
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<Option<DecoderOutput>, DecoderError> {
        let open = self.open.as_mut().ok_or(DecoderError::NotOpen)?;
        if self.pending.is_empty() {
            return Ok(None);
        }
        if !open.format_reported {
            open.format_reported = true;
            return Ok(Some(DecoderOutput::FormatChanged(open.format)));
        }
        Ok(self.pending.pop_front().map(DecoderOutput::Frame))
    }

    fn release_output(&mut self, buffer: OutputBuffer, render: bool) -> Result<(), DecoderError> {
        let open = self.open.as_ref().ok_or(DecoderError::NotOpen)?;
        if render {
            open.surface.present(VideoFrame {
                width: open.format.width,
                height: open.format.height,
                pts_us: buffer.pts_us,
                format: PixelFormat::Rgb24,
                data: open.placeholder.clone(),
            });
        }
        Ok(())
    }

    fn release(&mut self) {
        self.open = None;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::FrameSurface;

    /// Baseline SPS declaring 100001 x 100001 macroblocks.
    fn oversized_sps() -> Vec<u8> {
        let ue = |v: u32| {
            let code = v + 1;
            let bits = 32 - code.leading_zeros();
            let mut out = "0".repeat(bits as usize - 1);
            out.push_str(&format!("{code:b}"));
            out
        };
        let mut bits = String::new();
        bits += &ue(0); // seq_parameter_set_id
        bits += &ue(0); // log2_max_frame_num_minus4
        bits += &ue(0); // pic_order_cnt_type
        bits += &ue(0); // log2_max_pic_order_cnt_lsb_minus4
        bits += &ue(1); // max_num_ref_frames
        bits += "0"; // gaps_in_frame_num_value_allowed_flag
        bits += &ue(100_000); // pic_width_in_mbs_minus1
        bits += &ue(100_000); // pic_height_in_map_units_minus1
        bits += "1"; // frame_mbs_only_flag
        bits += "1"; // direct_8x8_inference_flag
        bits += "0"; // frame_cropping_flag
        bits += "0"; // vui_parameters_present_flag
        bits += "1"; // rbsp_stop_one_bit
        while bits.len() % 8 != 0 {
            bits.push('0');
        }

        let mut rbsp = vec![0x42, 0xC0, 0x1E];
        for byte in bits.as_bytes().chunks(8) {
            let byte = std::str::from_utf8(byte).unwrap();
            rbsp.push(u8::from_str_radix(byte, 2).unwrap());
        }

        // Emulation prevention.
        let mut nal = vec![0x67];
        let mut zeros = 0;
        for b in rbsp {
            if zeros >= 2 && b <= 3 {
                nal.push(0x03);
                zeros = 0;
            }
            nal.push(b);
            zeros = if b == 0 { zeros + 1 } else { 0 };
        }
        nal
    }

    fn opened() -> (NullDecoder, Arc<FrameSurface>) {
        let surface = Arc::new(FrameSurface::new());
        let mut dec = NullDecoder::new();
        let config = DecoderConfig::new(&[0x67, 0x42], &[0x68, 0xCE]);
        dec.open(&config, surface.clone()).unwrap();
        (dec, surface)
    }

    #[test]
    fn input_before_open_fails() {
        let mut dec = NullDecoder::new();
        assert!(matches!(
            dec.queue_input(&[0x65], 0, Duration::ZERO),
            Err(DecoderError::NotOpen)
        ));
    }

    #[test]
    fn unparseable_sps_uses_fallback_size() {
        let (dec, _) = opened();
        let format = dec.format().unwrap();
        assert_eq!((format.width, format.height), FALLBACK_DIMENSIONS);
    }

    #[test]
    fn oversized_sps_is_rejected() {
        let mut dec = NullDecoder::new();
        let config = DecoderConfig::new(&oversized_sps(), &[0x68, 0xCE]);
        assert_eq!(config.dimensions(), Some((1_600_016, 1_600_016)));
        assert!(matches!(
            dec.open(&config, Arc::new(FrameSurface::new())),
            Err(DecoderError::Configure(_))
        ));
        assert!(dec.format().is_none());
    }

    #[test]
    fn format_change_precedes_first_frame() {
        let (mut dec, surface) = opened();
        assert!(dec.dequeue_output(Duration::ZERO).unwrap().is_none());
        dec.queue_input(&[0x65, 0x88], 1000, Duration::ZERO).unwrap();

        let first = dec.dequeue_output(Duration::ZERO).unwrap();
        assert!(matches!(first, Some(DecoderOutput::FormatChanged(_))));

        let Some(DecoderOutput::Frame(buf)) = dec.dequeue_output(Duration::ZERO).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(buf.pts_us, 1000);
        dec.release_output(buf, true).unwrap();

        let frame = surface.snapshot().unwrap();
        assert_eq!(frame.pts_us, 1000);
        assert_eq!(frame.data.len(), 320 * 240 * 3);
        assert_eq!(&frame.data[..3], &PLACEHOLDER_RGB);
    }

    #[test]
    fn non_vcl_units_produce_no_output() {
        let (mut dec, _) = opened();
        dec.queue_input(&[0x06, 0x05], 1, Duration::ZERO).unwrap();
        dec.queue_input(&[0x09, 0x10], 2, Duration::ZERO).unwrap();
        assert!(dec.dequeue_output(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn unrendered_release_leaves_surface_empty() {
        let (mut dec, surface) = opened();
        dec.queue_input(&[0x41, 0x9A], 1, Duration::ZERO).unwrap();
        dec.dequeue_output(Duration::ZERO).unwrap();
        let Some(DecoderOutput::Frame(buf)) = dec.dequeue_output(Duration::ZERO).unwrap() else {
            panic!("expected a frame");
        };
        dec.release_output(buf, false).unwrap();
        assert!(surface.snapshot().is_none());
    }

    #[test]
    fn backpressure_when_outputs_are_not_drained() {
        let (mut dec, _) = opened();
        for pts in 0..MAX_PENDING as u64 {
            assert!(dec.queue_input(&[0x41], pts, Duration::ZERO).unwrap());
        }
        assert!(!dec.queue_input(&[0x41], 99, Duration::ZERO).unwrap());
    }

    #[test]
    fn release_is_idempotent() {
        let (mut dec, _) = opened();
        dec.release();
        dec.release();
        assert!(dec.format().is_none());
    }
}
