//! # Stream Session
//!
//! Composes receiver, reassembler, parameter-set cache and decoder bridge
//! into one start/stop unit.
//!
//! ```text
//! receive thread:  datagram ─► consumers ─► NalReassembler ─► NalEvent
//!                                                              │
//!                         Sps/Pps ─► ParameterSets ─► DecoderBridge::configure
//!                         Generic ─────────────────► DecoderBridge::enqueue
//! decode thread:   DecodeQueue ─► VideoDecoder ─► FrameSurface
//! ```
//!
//! Counters live in one [`PipelineStats`] that outlives restarts. Each
//! `start` builds a fresh reassembler, parameter-set cache and bridge.

use crate::decoder::bridge::{BridgeConfig, BridgeState, DecoderBridge};
use crate::decoder::{null::NullDecoder, DecoderFactory, VideoDecoder};
use crate::media::nal;
use crate::media::params::{DecoderConfig, ParameterSets};
use crate::media::reassembler::{NalEvent, NalReassembler, ReassemblerConfig};
use crate::net::NetworkBinding;
use crate::receiver::{PacketReceiver, DEFAULT_READ_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::stats::{ClientGuard, PipelineStats, StreamStats};
use crate::surface::{self, FrameSurface, OutputSurface, DEFAULT_JPEG_QUALITY};
use anyhow::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Receives every raw datagram before reassembly.
///
/// Runs on the receive thread; keep it short.
pub trait PacketConsumer: Send + Sync {
    fn on_packet(&self, packet: &Bytes) -> Result<()>;
}

impl<F> PacketConsumer for F
where
    F: Fn(&Bytes) -> Result<()> + Send + Sync,
{
    fn on_packet(&self, packet: &Bytes) -> Result<()> {
        self(packet)
    }
}

/// Handle returned by [`StreamSession::add_consumer`].
pub type ConsumerId = u64;

type ConsumerList = Arc<Mutex<Vec<(ConsumerId, Arc<dyn PacketConsumer>)>>>;

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub binding: Option<NetworkBinding>,
    pub read_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub reassembler: ReassemblerConfig,
    pub bridge: BridgeConfig,
    pub jpeg_quality: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            binding: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            reassembler: ReassemblerConfig::default(),
            bridge: BridgeConfig::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

struct Active {
    receiver: PacketReceiver,
    bridge: Arc<DecoderBridge>,
    started: quanta::Instant,
}

pub struct StreamSession {
    config: SessionConfig,
    factory: DecoderFactory,
    stats: Arc<PipelineStats>,
    surface: Arc<FrameSurface>,
    consumers: ConsumerList,
    next_consumer: AtomicU64,
    active: Mutex<Option<Active>>,
    /// Uptime of the last finished run, reported while stopped.
    last_uptime: Mutex<Duration>,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl StreamSession {
    /// Session using the monitor-mode decoder.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_decoder(
            config,
            Arc::new(|| Box::new(NullDecoder::new()) as Box<dyn VideoDecoder>),
        )
    }

    pub fn with_decoder(config: SessionConfig, factory: DecoderFactory) -> Self {
        Self {
            config,
            factory,
            stats: Arc::new(PipelineStats::new()),
            surface: Arc::new(FrameSurface::new()),
            consumers: Arc::new(Mutex::new(Vec::new())),
            next_consumer: AtomicU64::new(1),
            active: Mutex::new(None),
            last_uptime: Mutex::new(Duration::ZERO),
        }
    }

    /// Start streaming on `port`. Returns `false` if setup failed.
    pub fn start(&self, port: u16) -> bool {
        match self.try_start(port) {
            Ok(_) => true,
            Err(e) => {
                error!(port, error = %e, "failed to start stream");
                false
            }
        }
    }

    /// Start streaming on `port`, returning the bound address.
    ///
    /// Calling this while already streaming returns the current address.
    pub fn try_start(&self, port: u16) -> Result<SocketAddr> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref() {
            if let Some(addr) = current.receiver.local_addr() {
                debug!(%addr, "already streaming");
                return Ok(addr);
            }
        }

        let bridge = Arc::new(DecoderBridge::with_config(
            (self.factory)(),
            self.stats.clone(),
            self.config.bridge.clone(),
        ));

        let mut pipeline = ReceivePipeline {
            consumers: self.consumers.clone(),
            reassembler: NalReassembler::with_config(self.config.reassembler),
            params: ParameterSets::new(),
            bridge: bridge.clone(),
            surface: self.surface.clone(),
            stats: self.stats.clone(),
        };

        let mut receiver = PacketReceiver::with_timeouts(
            self.stats.clone(),
            self.config.read_timeout,
            self.config.shutdown_timeout,
        );
        let addr = match receiver.start(port, self.config.binding.as_ref(), move |packet| {
            pipeline.on_packet(packet)
        }) {
            Ok(addr) => addr,
            Err(e) => {
                bridge.release();
                return Err(e);
            }
        };

        *active = Some(Active {
            receiver,
            bridge,
            started: quanta::Instant::now(),
        });
        info!(%addr, "stream started");
        Ok(addr)
    }

    /// Stop the receiver, then release the decoder. Idempotent.
    pub fn stop(&self) {
        let taken = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut active) = taken else {
            return;
        };
        active.receiver.stop();
        active.bridge.release();
        *self.last_uptime.lock().unwrap_or_else(|e| e.into_inner()) = active.started.elapsed();
        info!(
            packets = self.stats.packets_received(),
            frames = self.stats.frames_decoded(),
            "stream stopped"
        );
    }

    pub fn is_streaming(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|a| a.receiver.local_addr())
    }

    pub fn get_stats(&self) -> StreamStats {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.as_ref() {
            Some(a) => self
                .stats
                .snapshot(true, a.bridge.state().as_str(), a.started.elapsed()),
            None => {
                let uptime = *self.last_uptime.lock().unwrap_or_else(|e| e.into_inner());
                self.stats.snapshot(false, "stopped", uptime)
            }
        }
    }

    /// JPEG of the most recently rendered frame.
    pub fn capture_current_frame(&self) -> Option<Vec<u8>> {
        surface::capture_jpeg(self.surface.as_ref(), self.config.jpeg_quality)
    }

    /// The surface decoded frames are presented to.
    pub fn surface(&self) -> Arc<FrameSurface> {
        self.surface.clone()
    }

    /// JPEG quality for captures and the MJPEG stream.
    pub fn jpeg_quality(&self) -> u8 {
        self.config.jpeg_quality
    }

    /// Count a live viewer in [`StreamStats::clients`] until the guard drops.
    pub fn connect_client(&self) -> ClientGuard {
        self.stats.client_connected()
    }

    /// Register a raw-datagram consumer. Takes effect immediately, also on
    /// a running session.
    pub fn add_consumer(&self, consumer: Arc<dyn PacketConsumer>) -> ConsumerId {
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, consumer));
        id
    }

    /// Returns whether a consumer with `id` was registered.
    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        let before = consumers.len();
        consumers.retain(|(cid, _)| *cid != id);
        consumers.len() != before
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the receive thread for one run.
struct ReceivePipeline {
    consumers: ConsumerList,
    reassembler: NalReassembler,
    params: ParameterSets,
    bridge: Arc<DecoderBridge>,
    surface: Arc<FrameSurface>,
    stats: Arc<PipelineStats>,
}

impl ReceivePipeline {
    fn on_packet(&mut self, packet: Bytes) {
        self.fan_out(&packet);

        self.reassembler.feed(&packet);
        let events: Vec<NalEvent> = self.reassembler.drain_events().collect();
        for event in events {
            self.on_event(event);
        }
    }

    fn fan_out(&self, packet: &Bytes) {
        let consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
        for (id, consumer) in consumers.iter() {
            match catch_unwind(AssertUnwindSafe(|| consumer.on_packet(packet))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(consumer = *id, error = %e, "packet consumer failed"),
                Err(_) => warn!(consumer = *id, "packet consumer panicked"),
            }
        }
    }

    fn on_event(&mut self, event: NalEvent) {
        match event {
            NalEvent::Sps { payload } => {
                self.stats.record_nal();
                debug!(len = payload.len(), "sps");
                let config = self.params.update_sps(payload).cloned();
                self.try_configure(config);
            }
            NalEvent::Pps { payload } => {
                self.stats.record_nal();
                debug!(len = payload.len(), "pps");
                let config = self.params.update_pps(payload).cloned();
                self.try_configure(config);
            }
            NalEvent::Keyframe { payload } => {
                debug!(len = payload.len(), "keyframe");
            }
            NalEvent::Generic { payload, nal_type } => {
                self.stats.record_nal();
                trace!(nal = nal::type_name(nal_type), len = payload.len(), "nal unit");
                self.bridge.enqueue(payload);
            }
        }
    }

    fn try_configure(&self, config: Option<DecoderConfig>) {
        let Some(config) = config else {
            return;
        };
        // Running ignores refreshes; Released has nothing left to configure.
        if matches!(self.bridge.state(), BridgeState::Running | BridgeState::Released) {
            return;
        }
        let surface: Arc<dyn OutputSurface> = self.surface.clone();
        if let Err(e) = self.bridge.configure(&config, surface) {
            warn!(error = %e, "decoder configure failed, waiting for new parameter sets");
        }
    }
}
