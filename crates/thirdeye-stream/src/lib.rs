//! # thirdeye-stream
//!
//! Low-latency receive path for a live H.264 camera feed carried as a raw
//! Annex-B byte stream over UDP.
//!
//! ```text
//! socket ─► PacketReceiver ─► NalReassembler ─► DecodeQueue ─► DecoderBridge ─► OutputSurface
//!           (receive thread)   (inline)          (drop-oldest)  (decode thread)
//! ```
//!
//! ## Crate structure
//!
//! - [`receiver`]: UDP socket + receive thread
//! - [`media`]: Annex-B reassembly, NAL classification, SPS/PPS cache
//! - [`queue`]: bounded drop-oldest decode queue
//! - [`decoder`]: decoder backend trait, backends, and the decode-thread bridge
//! - [`surface`]: output surfaces and JPEG snapshots
//! - [`session`]: composes everything into one start/stop unit
//! - [`stats`]: shared atomic counters and serializable snapshots
//! - [`metrics`]: Prometheus / JSON status HTTP server
//! - [`config`]: TOML configuration
//! - [`net`]: socket creation and interface binding

pub mod config;
pub mod decoder;
pub mod media;
pub mod metrics;
pub mod net;
pub mod queue;
pub mod receiver;
pub mod session;
pub mod stats;
pub mod surface;

pub use decoder::bridge::{BridgeState, DecoderBridge};
pub use media::reassembler::{NalEvent, NalReassembler};
pub use receiver::PacketReceiver;
pub use session::StreamSession;
pub use stats::StreamStats;
