//! # Decode Queue
//!
//! Bounded FIFO between the receive thread and the decode thread. Pushing
//! never blocks: when the queue is full the oldest item is evicted so the
//! decoder always works on the freshest data.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default number of NAL units held before eviction starts.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Drop-oldest bounded queue of NAL payloads.
#[derive(Debug)]
pub struct DecodeQueue {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    capacity: usize,
    dropped: AtomicU64,
}

impl DecodeQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append `item`, evicting the oldest entries while the queue is full.
    ///
    /// Returns how many items were evicted.
    pub fn push(&self, item: Bytes) -> u64 {
        let mut evicted = 0;
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    // The consumer may win the race for the head; either way
                    // a slot frees up.
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                // Both ends live in `self`, so this cannot disconnect.
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        if evicted > 0 {
            self.dropped.fetch_add(evicted, Ordering::Relaxed);
        }
        evicted
    }

    /// Wait up to `timeout` for the next item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Bytes> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the next item without waiting.
    pub fn try_pop(&self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Discard everything currently queued. Returns the number removed.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for DecodeQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
