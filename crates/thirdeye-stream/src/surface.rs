//! # Output Surfaces
//!
//! Where decoded frames end up. The decode thread calls
//! [`OutputSurface::present`] for every rendered frame; [`FrameSurface`]
//! keeps the most recent one so it can be captured as a JPEG.

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use serde::Serialize;
use std::sync::Arc;

/// Default JPEG quality for snapshots.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Largest picture accepted anywhere in the pipeline: the H.264 level 6.2
/// limit of 139 264 macroblocks of 16x16 pixels.
pub const MAX_FRAME_PIXELS: u64 = 139_264 * 256;

/// Byte length of a packed RGB picture, or `None` when the size is zero or
/// exceeds [`MAX_FRAME_PIXELS`].
pub fn rgb_frame_len(width: u32, height: u32) -> Option<usize> {
    let pixels = u64::from(width).checked_mul(u64::from(height))?;
    if pixels == 0 || pixels > MAX_FRAME_PIXELS {
        return None;
    }
    usize::try_from(pixels.checked_mul(3)?).ok()
}

/// Layout of [`VideoFrame::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 8-bit RGB, `width * height * 3` bytes.
    Rgb24,
    /// Backend-specific bytes that cannot be converted to an image.
    Opaque,
}

/// Output picture description reported by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// One decoded picture.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp the frame was submitted with.
    pub pts_us: u64,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl VideoFrame {
    /// Solid-colour RGB frame. `None` if the size is out of range.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], pts_us: u64) -> Option<Self> {
        let len = rgb_frame_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len / 3 {
            data.extend_from_slice(&rgb);
        }
        Some(VideoFrame {
            width,
            height,
            pts_us,
            format: PixelFormat::Rgb24,
            data: Bytes::from(data),
        })
    }

    /// Encode as baseline JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        if self.format != PixelFormat::Rgb24 {
            bail!("frame format {:?} cannot be encoded as JPEG", self.format);
        }
        let Some(expected) = rgb_frame_len(self.width, self.height) else {
            bail!("unsupported frame size {}x{}", self.width, self.height);
        };
        if self.data.len() < expected {
            bail!(
                "frame buffer too small: {} bytes for {}x{}",
                self.data.len(),
                self.width,
                self.height
            );
        }
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.data[..expected], self.width, self.height, ColorType::Rgb8)
            .context("JPEG encode failed")?;
        Ok(out)
    }
}

/// Sink for decoded frames.
///
/// Called from the decode thread, so implementations must be cheap and
/// must not block.
pub trait OutputSurface: Send + Sync {
    /// Show `frame`.
    fn present(&self, frame: VideoFrame);

    /// The decoder's output format changed.
    fn format_changed(&self, _format: VideoFormat) {}

    /// Most recently presented frame, if the surface retains one.
    fn snapshot(&self) -> Option<VideoFrame> {
        None
    }
}

/// Surface that keeps only the latest frame.
#[derive(Default)]
pub struct FrameSurface {
    latest: ArcSwapOption<VideoFrame>,
    format: ArcSwapOption<VideoFormat>,
}

impl FrameSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reported output format.
    pub fn format(&self) -> Option<VideoFormat> {
        self.format.load_full().map(|f| *f)
    }
}

impl OutputSurface for FrameSurface {
    fn present(&self, frame: VideoFrame) {
        self.latest.store(Some(Arc::new(frame)));
    }

    fn format_changed(&self, format: VideoFormat) {
        self.format.store(Some(Arc::new(format)));
    }

    fn snapshot(&self) -> Option<VideoFrame> {
        self.latest.load_full().map(|f| (*f).clone())
    }
}

/// Encode the surface's current frame, if any.
pub fn capture_jpeg(surface: &dyn OutputSurface, quality: u8) -> Option<Vec<u8>> {
    let frame = surface.snapshot()?;
    match frame.to_jpeg(quality) {
        Ok(jpeg) => Some(jpeg),
        Err(e) => {
            tracing::warn!(error = %e, "frame capture failed");
            None
        }
    }
}
