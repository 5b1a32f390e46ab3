//! # Annex-B Reassembler
//!
//! Pure logic, no I/O. Accepts raw byte chunks exactly as they came off the
//! socket, finds start-code boundaries, and emits complete NAL units as
//! [`NalEvent`]s.
//!
//! UDP gives no framing guarantee: a datagram may end mid-start-code, carry
//! several NAL units, or carry a fragment of one. The reassembler keeps the
//! unresolved tail (from the last start code onward) and resolves it once the
//! next start code arrives, so a NAL unit is emitted one start code late.
//!
//! Not thread-safe by construction: it must be driven by exactly one caller
//! (the receive thread) to preserve ordering.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::debug;

use super::nal::{self, NalUnit, StartCode};

/// Discard threshold for a buffer that holds no start code at all.
pub const DEFAULT_SYNC_LOSS_LIMIT: usize = 64 * 1024;

/// Discard threshold for a single unterminated NAL unit.
pub const DEFAULT_MAX_NAL_BYTES: usize = 2 * 1024 * 1024;

// ─── Events ─────────────────────────────────────────────────────────────────

/// Everything the reassembler reports, in emission order.
///
/// An IDR slice produces `Keyframe` immediately followed by `Generic` for the
/// same payload. SPS and PPS produce only their dedicated variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NalEvent {
    /// Any NAL unit that is not a parameter set.
    Generic { payload: Bytes, nal_type: u8 },
    /// Sequence parameter set.
    Sps { payload: Bytes },
    /// Picture parameter set.
    Pps { payload: Bytes },
    /// IDR slice; a `Generic` event for the same payload follows.
    Keyframe { payload: Bytes },
}

impl NalEvent {
    /// Payload carried by the event (start code stripped).
    pub fn payload(&self) -> &Bytes {
        match self {
            NalEvent::Generic { payload, .. }
            | NalEvent::Sps { payload }
            | NalEvent::Pps { payload }
            | NalEvent::Keyframe { payload } => payload,
        }
    }
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Reassembler limits.
#[derive(Debug, Clone, Copy)]
pub struct ReassemblerConfig {
    /// Bytes buffered without any start code before the buffer is dropped.
    pub sync_loss_limit: usize,
    /// Largest unterminated NAL unit kept before it is dropped.
    pub max_nal_bytes: usize,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        ReassemblerConfig {
            sync_loss_limit: DEFAULT_SYNC_LOSS_LIMIT,
            max_nal_bytes: DEFAULT_MAX_NAL_BYTES,
        }
    }
}

// ─── Reassembler ────────────────────────────────────────────────────────────

/// Stateful Annex-B splitter.
#[derive(Debug)]
pub struct NalReassembler {
    config: ReassemblerConfig,
    /// Unresolved bytes. When `current` is set, `buffer[0..]` begins with
    /// that start code.
    buffer: BytesMut,
    /// Start code opening the NAL unit currently being accumulated.
    current: Option<StartCode>,
    /// Where the next `00 00 01` search begins.
    scan_pos: usize,
    events: VecDeque<NalEvent>,
}

impl Default for NalReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl NalReassembler {
    pub fn new() -> Self {
        Self::with_config(ReassemblerConfig::default())
    }

    pub fn with_config(config: ReassemblerConfig) -> Self {
        NalReassembler {
            config,
            buffer: BytesMut::with_capacity(64 * 1024),
            current: None,
            scan_pos: 0,
            events: VecDeque::new(),
        }
    }

    /// Append a chunk and resolve every NAL unit it completes.
    ///
    /// Chunks must be fed exactly once each, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(sc) = nal::find_start_code(&self.buffer, self.scan_pos) {
            match self.current {
                Some(open) => {
                    // Everything between the open start code and this one is
                    // one complete unit.
                    let mut unit = self.buffer.split_to(sc.head);
                    unit.advance(open.end());
                    self.emit(unit.freeze());
                }
                None => {
                    // First boundary after (re)sync: leading bytes belong to a
                    // unit whose start we never saw.
                    if sc.head > 0 {
                        debug!(skipped = sc.head, "dropping bytes before first start code");
                    }
                    self.buffer.advance(sc.head);
                }
            }
            let rebased = StartCode { head: 0, len: sc.len };
            self.current = Some(rebased);
            self.scan_pos = rebased.end();
        }

        // Resume the next search where a start code straddling the chunk
        // boundary could still begin.
        self.scan_pos = self
            .scan_pos
            .max(self.buffer.len().saturating_sub(2));

        self.enforce_limits();
    }

    /// Emit the pending tail as a final NAL unit (end of stream).
    pub fn flush(&mut self) {
        if let Some(open) = self.current.take() {
            let mut tail = self.buffer.split();
            tail.advance(open.end().min(tail.len()));
            self.emit(tail.freeze());
        }
        self.clear_buffer();
    }

    /// Drop all buffered bytes and pending events.
    pub fn reset(&mut self) {
        self.clear_buffer();
        self.events.clear();
    }

    /// Drain the events produced so far.
    pub fn drain_events(&mut self) -> impl Iterator<Item = NalEvent> + '_ {
        self.events.drain(..)
    }

    /// Number of undrained events.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Bytes currently held in the accumulation buffer.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.current = None;
        self.scan_pos = 0;
    }

    fn enforce_limits(&mut self) {
        match self.current {
            None if self.buffer.len() > self.config.sync_loss_limit => {
                debug!(
                    buffered = self.buffer.len(),
                    "no start code within sync-loss limit, discarding"
                );
                self.clear_buffer();
            }
            Some(_) if self.buffer.len() > self.config.max_nal_bytes => {
                debug!(
                    buffered = self.buffer.len(),
                    "unterminated NAL unit exceeds limit, discarding"
                );
                self.clear_buffer();
            }
            _ => {}
        }
    }

    fn emit(&mut self, payload: Bytes) {
        let Some(unit) = NalUnit::parse(payload) else {
            // Back-to-back start codes.
            return;
        };
        match unit.nal_type {
            nal::NAL_SPS => self.events.push_back(NalEvent::Sps {
                payload: unit.payload,
            }),
            nal::NAL_PPS => self.events.push_back(NalEvent::Pps {
                payload: unit.payload,
            }),
            nal_type => {
                if unit.is_keyframe {
                    self.events.push_back(NalEvent::Keyframe {
                        payload: unit.payload.clone(),
                    });
                }
                self.events.push_back(NalEvent::Generic {
                    payload: unit.payload,
                    nal_type,
                });
            }
        }
    }
}
