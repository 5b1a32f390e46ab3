//! # Decoder Backends
//!
//! [`VideoDecoder`] is the seam between the pipeline and whatever actually
//! turns NAL units into pictures. Its shape follows hardware codec APIs:
//! configure once with SPS/PPS, queue input with a timestamp, drain output
//! buffers and release each one, optionally rendering it.
//!
//! The [`bridge::DecoderBridge`] owns a backend and drives it from a
//! dedicated decode thread.

pub mod bridge;
#[cfg(feature = "gstreamer")]
pub mod gstreamer;
pub mod null;

use crate::media::params::DecoderConfig;
use crate::surface::{OutputSurface, VideoFormat};
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by a decoder backend.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("decoder configuration failed: {0}")]
    Configure(String),
    #[error("decoder input failed: {0}")]
    Input(String),
    #[error("decoder output failed: {0}")]
    Output(String),
    #[error("decoder is not open")]
    NotOpen,
    #[error("decoder has been released")]
    Released,
    #[error("decoder backend unavailable: {0}")]
    Unavailable(String),
}

/// Handle to a decoded buffer waiting to be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBuffer {
    /// Backend-specific buffer slot.
    pub index: usize,
    pub pts_us: u64,
}

/// One item drained from the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderOutput {
    Frame(OutputBuffer),
    FormatChanged(VideoFormat),
}

/// A video decoder instance.
///
/// All methods are called from a single thread at a time.
pub trait VideoDecoder: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Configure with SPS/PPS and start. Frames released with `render`
    /// go to `surface`.
    fn open(
        &mut self,
        config: &DecoderConfig,
        surface: Arc<dyn OutputSurface>,
    ) -> Result<(), DecoderError>;

    /// Submit one NAL unit (no start code). Returns `Ok(false)` when no
    /// input buffer became available within `timeout`.
    fn queue_input(
        &mut self,
        nal: &[u8],
        pts_us: u64,
        timeout: Duration,
    ) -> Result<bool, DecoderError>;

    /// Fetch the next ready output, waiting at most `timeout`.
    fn dequeue_output(&mut self, timeout: Duration) -> Result<Option<DecoderOutput>, DecoderError>;

    /// Hand a dequeued buffer back, presenting it to the surface when
    /// `render` is set.
    fn release_output(&mut self, buffer: OutputBuffer, render: bool) -> Result<(), DecoderError>;

    /// Stop and free the decoder. Safe to call more than once.
    fn release(&mut self);
}

/// Builds a fresh decoder for each session start.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn VideoDecoder> + Send + Sync>;

/// Which backend a session should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderBackend {
    /// Monitor mode: counts frames and renders a placeholder.
    Null,
    /// GStreamer pipeline around the named decoder element.
    Gstreamer,
}

impl DecoderBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoderBackend::Null => "null",
            DecoderBackend::Gstreamer => "gstreamer",
        }
    }
}

impl std::str::FromStr for DecoderBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null" | "none" => Ok(DecoderBackend::Null),
            "gstreamer" | "gst" => Ok(DecoderBackend::Gstreamer),
            other => anyhow::bail!("unknown decoder backend: {other}"),
        }
    }
}

/// Resolve a backend into a factory. `element` names the GStreamer decoder.
pub fn factory_for(backend: &DecoderBackend, element: &str) -> anyhow::Result<DecoderFactory> {
    match backend {
        DecoderBackend::Null => Ok(Arc::new(|| {
            Box::new(null::NullDecoder::new()) as Box<dyn VideoDecoder>
        })),
        #[cfg(feature = "gstreamer")]
        DecoderBackend::Gstreamer => {
            gstreamer::init()?;
            let element = element.to_string();
            Ok(Arc::new(move || {
                Box::new(gstreamer::GstDecoder::new(&element)) as Box<dyn VideoDecoder>
            }))
        }
        #[cfg(not(feature = "gstreamer"))]
        DecoderBackend::Gstreamer => {
            let _ = element;
            anyhow::bail!("built without the `gstreamer` feature")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_from_str() {
        assert_eq!("null".parse::<DecoderBackend>().unwrap(), DecoderBackend::Null);
        assert_eq!("GST".parse::<DecoderBackend>().unwrap(), DecoderBackend::Gstreamer);
        assert!("ffmpeg".parse::<DecoderBackend>().is_err());
    }

    #[test]
    fn null_factory_builds_fresh_decoders() {
        let factory = factory_for(&DecoderBackend::Null, "unused").unwrap();
        assert_eq!(factory().name(), "null");
        assert_eq!(factory().name(), "null");
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn gstreamer_requires_feature() {
        assert!(factory_for(&DecoderBackend::Gstreamer, "avdec_h264").is_err());
    }
}
