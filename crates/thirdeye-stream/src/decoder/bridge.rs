//! # Decoder Bridge
//!
//! Owns one [`VideoDecoder`] and the decode thread that feeds it.
//!
//! ```text
//! Unconfigured ──configure()──► Configuring ──ok──► Running ──release()──► Released
//!       ▲                            │
//!       └────────── error ───────────┘
//! ```
//!
//! The receive thread calls [`DecoderBridge::enqueue`]; payloads are
//! accepted only while `Running` and go through a drop-oldest
//! [`DecodeQueue`]. The decode thread pops them, stamps a strictly
//! increasing microsecond timestamp, submits them, and drains every ready
//! output to the surface.
//!
//! A backend that panics takes the bridge straight to `Released`: the
//! decode thread catches the unwind, frees what it can and empties the
//! queue so nothing keeps piling up behind a dead decoder.

use super::{DecoderError, DecoderOutput, VideoDecoder};
use crate::media::params::DecoderConfig;
use crate::queue::{DecodeQueue, DEFAULT_QUEUE_CAPACITY};
use crate::stats::PipelineStats;
use crate::surface::OutputSurface;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`DecoderBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Unconfigured = 0,
    Configuring = 1,
    Running = 2,
    Released = 3,
}

impl BridgeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BridgeState::Unconfigured,
            1 => BridgeState::Configuring,
            2 => BridgeState::Running,
            _ => BridgeState::Released,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Unconfigured => "unconfigured",
            BridgeState::Configuring => "configuring",
            BridgeState::Running => "running",
            BridgeState::Released => "released",
        }
    }
}

/// Timing and sizing knobs for the decode thread.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Decode queue capacity.
    pub queue_capacity: usize,
    /// How long the decode thread waits on an empty queue.
    pub poll_interval: Duration,
    /// Timeout for a decoder input slot.
    pub input_timeout: Duration,
    /// How long `release()` waits for the decode thread.
    pub shutdown_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: Duration::from_millis(10),
            input_timeout: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

struct DecodeWorker {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
    /// Disconnects when the decode thread exits, even by panic.
    exited: Receiver<()>,
}

struct Control {
    /// Held here until the decode thread takes ownership.
    decoder: Option<Box<dyn VideoDecoder>>,
    worker: Option<DecodeWorker>,
}

pub struct DecoderBridge {
    /// Shared with the decode thread so a backend panic can retire the bridge.
    state: Arc<AtomicU8>,
    queue: Arc<DecodeQueue>,
    stats: Arc<PipelineStats>,
    config: BridgeConfig,
    control: Mutex<Control>,
}

impl DecoderBridge {
    pub fn new(decoder: Box<dyn VideoDecoder>, stats: Arc<PipelineStats>) -> Self {
        Self::with_config(decoder, stats, BridgeConfig::default())
    }

    pub fn with_config(
        decoder: Box<dyn VideoDecoder>,
        stats: Arc<PipelineStats>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(BridgeState::Unconfigured as u8)),
            queue: Arc::new(DecodeQueue::new(config.queue_capacity)),
            stats,
            config,
            control: Mutex::new(Control {
                decoder: Some(decoder),
                worker: None,
            }),
        }
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BridgeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.state() == BridgeState::Running
    }

    /// Items waiting for the decode thread.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Open the decoder with `config` and start the decode thread.
    ///
    /// Returns immediately while already running. A failed attempt leaves
    /// the bridge `Unconfigured` so a later parameter set can retry.
    pub fn configure(
        &self,
        config: &DecoderConfig,
        surface: Arc<dyn OutputSurface>,
    ) -> Result<(), DecoderError> {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        match self.state() {
            BridgeState::Running => return Ok(()),
            BridgeState::Released => return Err(DecoderError::Released),
            BridgeState::Unconfigured | BridgeState::Configuring => {}
        }

        let Some(mut decoder) = control.decoder.take() else {
            self.set_state(BridgeState::Unconfigured);
            return Err(DecoderError::Unavailable(
                "decoder was lost by an earlier failed start".into(),
            ));
        };
        self.set_state(BridgeState::Configuring);
        debug!(backend = decoder.name(), ?config, "configuring decoder");

        if let Err(e) = decoder.open(config, surface.clone()) {
            warn!(backend = decoder.name(), error = %e, "decoder configure failed");
            control.decoder = Some(decoder);
            self.set_state(BridgeState::Unconfigured);
            return Err(e);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = bounded::<()>(1);
        let backend = decoder.name();
        let loop_ctx = DecodeLoop {
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            surface,
            stop: stop.clone(),
            state: self.state.clone(),
            poll_interval: self.config.poll_interval,
            input_timeout: self.config.input_timeout,
            _exit: exit_tx,
        };

        let spawned = thread::Builder::new()
            .name("thirdeye-decode".into())
            .spawn(move || loop_ctx.run(decoder));
        match spawned {
            Ok(handle) => {
                control.worker = Some(DecodeWorker {
                    stop,
                    handle,
                    exited: exit_rx,
                });
                self.set_state(BridgeState::Running);
                info!(
                    backend,
                    codec = ?config.codec_string(),
                    dimensions = ?config.dimensions(),
                    "decoder running"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn decode thread");
                self.set_state(BridgeState::Unconfigured);
                Err(DecoderError::Configure(format!("decode thread: {e}")))
            }
        }
    }

    /// Hand a NAL payload (no start code) to the decode thread.
    ///
    /// Ignored unless the bridge is running. Never blocks.
    pub fn enqueue(&self, payload: Bytes) {
        if !self.is_running() {
            return;
        }
        let evicted = self.queue.push(payload);
        if evicted > 0 {
            self.stats.record_dropped(evicted);
            debug!(evicted, "decode queue full, dropped oldest");
        }
    }

    /// Stop the decode thread and free the decoder. Idempotent.
    pub fn release(&self) {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        let previous = BridgeState::from_u8(
            self.state
                .swap(BridgeState::Released as u8, Ordering::AcqRel),
        );
        // The decode thread may have retired the bridge itself; its worker
        // still has to be joined.
        if previous == BridgeState::Released
            && control.worker.is_none()
            && control.decoder.is_none()
        {
            return;
        }

        if let Some(worker) = control.worker.take() {
            worker.stop.store(true, Ordering::Relaxed);
            match worker.exited.recv_timeout(self.config.shutdown_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        warn!("decode thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                        "decode thread did not stop in time, detaching"
                    );
                }
            }
        }

        if let Some(mut decoder) = control.decoder.take() {
            decoder.release();
        }

        let cleared = self.queue.clear();
        info!(cleared, "decoder released");
    }
}

impl Drop for DecoderBridge {
    fn drop(&mut self) {
        self.release();
    }
}

/// Everything the decode thread needs besides the decoder itself.
struct DecodeLoop {
    queue: Arc<DecodeQueue>,
    stats: Arc<PipelineStats>,
    surface: Arc<dyn OutputSurface>,
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    poll_interval: Duration,
    input_timeout: Duration,
    _exit: Sender<()>,
}

impl DecodeLoop {
    fn run(self, mut decoder: Box<dyn VideoDecoder>) {
        let backend = decoder.name();
        if catch_unwind(AssertUnwindSafe(|| self.decode(decoder.as_mut()))).is_err() {
            self.state
                .store(BridgeState::Released as u8, Ordering::Release);
            let cleared = self.queue.clear();
            error!(backend, cleared, "decoder panicked, bridge retired");
        }
        if catch_unwind(AssertUnwindSafe(|| decoder.release())).is_err() {
            warn!(backend, "decoder panicked during release");
        }
        debug!("decode thread exiting");
    }

    fn decode(&self, decoder: &mut dyn VideoDecoder) {
        let clock = quanta::Instant::now();
        let mut last_pts: Option<u64> = None;

        while !self.stop.load(Ordering::Relaxed) {
            if let Some(nal) = self.queue.pop_timeout(self.poll_interval) {
                let elapsed = clock.elapsed().as_micros() as u64;
                let pts = match last_pts {
                    Some(prev) if elapsed <= prev => prev + 1,
                    _ => elapsed,
                };
                last_pts = Some(pts);

                match decoder.queue_input(&nal, pts, self.input_timeout) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.stats.record_dropped(1);
                        debug!(pts, "no decoder input slot, dropped NAL");
                    }
                    Err(e) => warn!(error = %e, "decoder rejected input"),
                }
            }
            self.drain(decoder);
        }
    }

    fn drain(&self, decoder: &mut dyn VideoDecoder) {
        loop {
            match decoder.dequeue_output(Duration::ZERO) {
                Ok(Some(DecoderOutput::Frame(buffer))) => {
                    match decoder.release_output(buffer, true) {
                        Ok(()) => self.stats.record_decoded(),
                        Err(e) => warn!(error = %e, "failed to release output buffer"),
                    }
                }
                Ok(Some(DecoderOutput::FormatChanged(format))) => {
                    info!(
                        width = format.width,
                        height = format.height,
                        pixel_format = ?format.pixel_format,
                        "decoder output format changed"
                    );
                    self.surface.format_changed(format);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "decoder output error");
                    break;
                }
            }
        }
    }
}
