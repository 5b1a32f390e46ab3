//! GStreamer decoder backend.
//!
//! ```text
//! appsrc ─► h264parse ─► <decoder element> ─► videoconvert ─► RGB appsink
//! ```
//!
//! `v4l2h264dec` reaches the stateful V4L2 hardware decoder on SBCs;
//! `avdec_h264` is the software fallback.
//!
//! The appsrc queue is capped at [`APPSRC_MAX_BYTES`]. When the element
//! falls behind, `queue_input` waits up to its timeout for room and then
//! reports no free slot, so the bridge's drop-oldest queue takes the
//! backlog instead of GStreamer.

use super::{DecoderError, DecoderOutput, OutputBuffer, VideoDecoder};
use crate::media::params::DecoderConfig;
use crate::surface::{OutputSurface, PixelFormat, VideoFormat, VideoFrame};
use bytes::Bytes;
use gst::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bytes of coded input appsrc may hold ahead of the decoder.
pub const APPSRC_MAX_BYTES: u64 = 1024 * 1024;

/// Poll step while waiting for appsrc to drain.
const ROOM_POLL: Duration = Duration::from_millis(1);

/// Whether `incoming` bytes fit behind `level` queued bytes. An empty queue
/// always takes the buffer so oversized units are not starved.
fn has_room(level: u64, incoming: usize) -> bool {
    level == 0 || level.saturating_add(incoming as u64) <= APPSRC_MAX_BYTES
}

/// Initialise GStreamer once per process.
pub fn init() -> anyhow::Result<()> {
    gst::init().map_err(|e| anyhow::anyhow!("gstreamer init failed: {e}"))
}

struct Pipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    surface: Arc<dyn OutputSurface>,
}

pub struct GstDecoder {
    element: String,
    active: Option<Pipeline>,
    format: Option<VideoFormat>,
    /// Frame pulled ahead of a format change, returned on the next dequeue.
    pending: Option<VideoFrame>,
    /// Dequeued frame waiting for `release_output`.
    held: Option<(usize, VideoFrame)>,
    next_index: usize,
}

impl GstDecoder {
    pub fn new(element: &str) -> Self {
        Self {
            element: element.to_string(),
            active: None,
            format: None,
            pending: None,
            held: None,
            next_index: 0,
        }
    }

    fn launch_description(&self) -> String {
        format!(
            "appsrc name=src is-live=true format=time block=false max-bytes={APPSRC_MAX_BYTES} \
             caps=video/x-h264,stream-format=byte-stream,alignment=nal \
             ! h264parse ! {} ! videoconvert ! video/x-raw,format=RGB \
             ! appsink name=sink sync=false max-buffers=4 drop=true",
            self.element
        )
    }

    fn check_bus(pipeline: &gst::Pipeline) -> Result<(), DecoderError> {
        let Some(bus) = pipeline.bus() else {
            return Ok(());
        };
        if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(DecoderError::Output(format!(
                    "{} ({:?})",
                    err.error(),
                    err.debug()
                )));
            }
        }
        Ok(())
    }

    fn sample_to_frame(sample: &gst::Sample) -> Option<VideoFrame> {
        let caps = sample.caps()?;
        let s = caps.structure(0)?;
        let width = s.get::<i32>("width").ok()?;
        let height = s.get::<i32>("height").ok()?;
        let buffer = sample.buffer_owned()?;
        let pts_us = buffer.pts().map(|t| t.useconds()).unwrap_or(0);
        // The mapping keeps the GStreamer buffer alive for as long as the
        // frame is referenced.
        let mapped = buffer.into_mapped_buffer_readable().ok()?;
        Some(VideoFrame {
            width: u32::try_from(width).ok()?,
            height: u32::try_from(height).ok()?,
            pts_us,
            format: PixelFormat::Rgb24,
            data: Bytes::from_owner(mapped),
        })
    }

    /// Wait up to `timeout` for appsrc to accept `incoming` more bytes.
    fn wait_for_room(appsrc: &gst_app::AppSrc, incoming: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if has_room(appsrc.current_level_bytes(), incoming) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(ROOM_POLL.min(deadline - now));
        }
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.appsrc.end_of_stream();
            if let Err(e) = active.pipeline.set_state(gst::State::Null) {
                warn!(error = ?e, "failed to stop decode pipeline");
            }
        }
        self.format = None;
        self.pending = None;
        self.held = None;
    }
}

impl VideoDecoder for GstDecoder {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn open(
        &mut self,
        config: &DecoderConfig,
        surface: Arc<dyn OutputSurface>,
    ) -> Result<(), DecoderError> {
        self.teardown();

        let desc = self.launch_description();
        debug!(pipeline = %desc, "launching decode pipeline");
        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| DecoderError::Configure(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| DecoderError::Configure("launch did not yield a pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.dynamic_cast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| DecoderError::Configure("appsrc missing".into()))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.dynamic_cast::<gst_app::AppSink>().ok())
            .ok_or_else(|| DecoderError::Configure("appsink missing".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| DecoderError::Configure(format!("{e:?}")))?;

        let mut header = gst::Buffer::from_slice(config.annex_b());
        if let Some(buf) = header.get_mut() {
            buf.set_flags(gst::BufferFlags::HEADER);
            buf.set_pts(gst::ClockTime::ZERO);
        }
        if let Err(e) = appsrc.push_buffer(header) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(DecoderError::Configure(format!("codec data rejected: {e:?}")));
        }

        self.active = Some(Pipeline {
            pipeline,
            appsrc,
            appsink,
            surface,
        });
        Ok(())
    }

    fn queue_input(
        &mut self,
        nal: &[u8],
        pts_us: u64,
        timeout: Duration,
    ) -> Result<bool, DecoderError> {
        let active = self.active.as_ref().ok_or(DecoderError::NotOpen)?;
        let len = nal.len() + crate::media::nal::START_CODE.len();
        if !Self::wait_for_room(&active.appsrc, len, timeout) {
            return Ok(false);
        }
        let mut data = Vec::with_capacity(len);
        data.extend_from_slice(&crate::media::nal::START_CODE);
        data.extend_from_slice(nal);
        let mut buffer = gst::Buffer::from_slice(data);
        if let Some(buf) = buffer.get_mut() {
            buf.set_pts(gst::ClockTime::from_useconds(pts_us));
        }
        match active.appsrc.push_buffer(buffer) {
            Ok(_) => Ok(true),
            Err(gst::FlowError::Flushing) => Ok(false),
            Err(e) => Err(DecoderError::Input(format!("{e:?}"))),
        }
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<Option<DecoderOutput>, DecoderError> {
        let active = self.active.as_ref().ok_or(DecoderError::NotOpen)?;
        Self::check_bus(&active.pipeline)?;

        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => {
                let wait = gst::ClockTime::from_useconds(timeout.as_micros() as u64);
                let Some(sample) = active.appsink.try_pull_sample(wait) else {
                    return Ok(None);
                };
                match Self::sample_to_frame(&sample) {
                    Some(frame) => frame,
                    None => return Ok(None),
                }
            }
        };

        let format = VideoFormat {
            width: frame.width,
            height: frame.height,
            pixel_format: PixelFormat::Rgb24,
        };
        if self.format != Some(format) {
            self.format = Some(format);
            self.pending = Some(frame);
            return Ok(Some(DecoderOutput::FormatChanged(format)));
        }

        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        let pts_us = frame.pts_us;
        self.held = Some((index, frame));
        Ok(Some(DecoderOutput::Frame(OutputBuffer { index, pts_us })))
    }

    fn release_output(&mut self, buffer: OutputBuffer, render: bool) -> Result<(), DecoderError> {
        let active = self.active.as_ref().ok_or(DecoderError::NotOpen)?;
        match self.held.take() {
            Some((index, frame)) if index == buffer.index => {
                if render {
                    active.surface.present(frame);
                }
                Ok(())
            }
            other => {
                self.held = other;
                Err(DecoderError::Output(format!(
                    "unknown output buffer {}",
                    buffer.index
                )))
            }
        }
    }

    fn release(&mut self) {
        self.teardown();
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_description_names_element() {
        let dec = GstDecoder::new("avdec_h264");
        let desc = dec.launch_description();
        assert!(desc.contains("! avdec_h264 !"));
        assert!(desc.contains("appsrc name=src"));
        assert!(desc.contains("appsink name=sink"));
        assert!(desc.contains(&format!("max-bytes={APPSRC_MAX_BYTES}")));
        assert!(desc.contains("block=false"));
    }

    #[test]
    fn full_appsrc_refuses_input() {
        assert!(has_room(0, 4 * APPSRC_MAX_BYTES as usize));
        assert!(has_room(1000, 1000));
        assert!(has_room(APPSRC_MAX_BYTES - 10, 10));
        assert!(!has_room(APPSRC_MAX_BYTES - 10, 11));
        assert!(!has_room(APPSRC_MAX_BYTES, 1));
    }

    #[test]
    fn input_before_open_fails() {
        let mut dec = GstDecoder::new(crate::config::DEFAULT_GST_ELEMENT);
        assert!(matches!(
            dec.queue_input(&[0x65], 0, Duration::ZERO),
            Err(DecoderError::NotOpen)
        ));
    }

    #[test]
    fn sample_frames_share_the_gstreamer_buffer() {
        init().unwrap();
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", 2i32)
            .field("height", 1i32)
            .build();
        let mut buffer = gst::Buffer::from_slice(vec![1u8, 2, 3, 4, 5, 6]);
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gst::ClockTime::from_useconds(42));
        let sample = gst::Sample::builder().buffer(&buffer).caps(&caps).build();

        let frame = GstDecoder::sample_to_frame(&sample).unwrap();
        assert_eq!((frame.width, frame.height, frame.pts_us), (2, 1, 42));
        assert_eq!(&frame.data[..], &[1, 2, 3, 4, 5, 6]);

        let original = buffer.map_readable().unwrap();
        assert_eq!(original.as_slice().as_ptr(), frame.data.as_ptr());
    }
}
