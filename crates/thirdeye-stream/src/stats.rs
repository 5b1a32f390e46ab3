//! # Pipeline Statistics
//!
//! Lock-free counters shared by the receive and decode threads, plus the
//! serializable snapshot handed to callers and the status server.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Live counters. Monotonic; never reset across session restarts.
#[derive(Debug, Default)]
pub struct PipelineStats {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    nal_units_found: AtomicU64,
    frames_decoded: AtomicU64,
    frames_dropped: AtomicU64,
    /// Gauge, not a counter: live MJPEG viewers.
    clients: AtomicU64,
}

/// Counts one connected viewer until dropped.
#[derive(Debug)]
pub struct ClientGuard {
    stats: Arc<PipelineStats>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.stats.clients.fetch_sub(1, Ordering::Relaxed);
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_nal(&self) {
        self.nal_units_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        if n > 0 {
            self.frames_dropped.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn nal_units_found(&self) -> u64 {
        self.nal_units_found.load(Ordering::Relaxed)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn clients(&self) -> u64 {
        self.clients.load(Ordering::Relaxed)
    }

    /// Register a viewer; the count drops again with the guard.
    pub fn client_connected(self: &Arc<Self>) -> ClientGuard {
        self.clients.fetch_add(1, Ordering::Relaxed);
        ClientGuard {
            stats: self.clone(),
        }
    }

    /// Capture the counters together with session-level state.
    pub fn snapshot(&self, is_streaming: bool, decoder_state: &str, uptime: Duration) -> StreamStats {
        let frames_decoded = self.frames_decoded();
        let uptime_secs = uptime.as_secs_f64();
        let decode_fps = if uptime_secs > 0.0 {
            frames_decoded as f64 / uptime_secs
        } else {
            0.0
        };
        StreamStats {
            packets_received: self.packets_received(),
            bytes_received: self.bytes_received(),
            nal_units_found: self.nal_units_found(),
            frames_decoded,
            frames_dropped: self.frames_dropped(),
            is_streaming,
            decoder_state: decoder_state.to_string(),
            uptime_secs,
            decode_fps,
            clients: self.clients(),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    /// UDP datagrams received.
    pub packets_received: u64,
    /// UDP payload bytes received.
    pub bytes_received: u64,
    /// NAL units emitted by the reassembler (keyframe markers excluded).
    pub nal_units_found: u64,
    /// Frames released to the output surface.
    pub frames_decoded: u64,
    /// NAL units evicted from the decode queue.
    pub frames_dropped: u64,
    pub is_streaming: bool,
    /// Decoder bridge state name.
    pub decoder_state: String,
    /// Seconds since the current (or last) start.
    pub uptime_secs: f64,
    /// Frames decoded per second of uptime.
    pub decode_fps: f64,
    /// Viewers connected to the MJPEG stream.
    pub clients: u64,
}

impl StreamStats {
    /// Fraction of received NAL units that were dropped before decode.
    pub fn drop_rate(&self) -> f64 {
        if self.nal_units_found == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.nal_units_found as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = PipelineStats::new();
        stats.record_packet(100);
        stats.record_packet(50);
        stats.record_nal();
        stats.record_decoded();
        stats.record_dropped(0);
        stats.record_dropped(3);
        assert_eq!(stats.packets_received(), 2);
        assert_eq!(stats.bytes_received(), 150);
        assert_eq!(stats.nal_units_found(), 1);
        assert_eq!(stats.frames_decoded(), 1);
        assert_eq!(stats.frames_dropped(), 3);
    }

    #[test]
    fn snapshot_computes_fps() {
        let stats = PipelineStats::new();
        for _ in 0..30 {
            stats.record_decoded();
        }
        let snap = stats.snapshot(true, "running", Duration::from_secs(2));
        assert!(snap.is_streaming);
        assert_eq!(snap.decoder_state, "running");
        assert!((snap.decode_fps - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_uptime_has_zero_fps() {
        let snap = PipelineStats::new().snapshot(false, "unconfigured", Duration::ZERO);
        assert_eq!(snap.decode_fps, 0.0);
        assert_eq!(snap.drop_rate(), 0.0);
    }

    #[test]
    fn client_guard_tracks_viewers() {
        let stats = Arc::new(PipelineStats::new());
        let a = stats.client_connected();
        let b = stats.client_connected();
        assert_eq!(stats.snapshot(true, "running", Duration::ZERO).clients, 2);
        drop(a);
        assert_eq!(stats.clients(), 1);
        drop(b);
        assert_eq!(stats.clients(), 0);
    }

    #[test]
    fn serializes_to_json() {
        let stats = PipelineStats::new();
        stats.record_packet(10);
        let json = serde_json::to_value(stats.snapshot(true, "running", Duration::from_secs(1)))
            .unwrap();
        assert_eq!(json["packets_received"], 1);
        assert_eq!(json["bytes_received"], 10);
        assert_eq!(json["is_streaming"], true);
        assert_eq!(json["decoder_state"], "running");
        assert_eq!(json["clients"], 0);
    }
}
