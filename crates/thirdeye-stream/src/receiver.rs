//! # Packet Receiver
//!
//! Owns the UDP socket and the receive thread. Every datagram is copied
//! into a fresh [`Bytes`] and handed to the caller's callback on the
//! receive thread, in arrival order.

use crate::net::{self, NetworkBinding};
use crate::stats::PipelineStats;
use anyhow::{bail, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest UDP payload.
pub const MAX_DATAGRAM: usize = 65_535;

/// Default socket read timeout; bounds how long the loop takes to notice a stop.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Default wait for the receive thread on `stop()`.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

struct ReceiveWorker {
    handle: thread::JoinHandle<()>,
    exited: Receiver<()>,
    local_addr: SocketAddr,
}

pub struct PacketReceiver {
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    worker: Option<ReceiveWorker>,
    read_timeout: Duration,
    shutdown_timeout: Duration,
}

impl PacketReceiver {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self::with_timeouts(stats, DEFAULT_READ_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeouts(
        stats: Arc<PipelineStats>,
        read_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stats,
            worker: None,
            read_timeout,
            shutdown_timeout,
        }
    }

    /// Bind `port` and start the receive thread.
    ///
    /// `on_packet` runs on the receive thread for each non-empty datagram.
    /// Returns the bound local address.
    pub fn start<F>(
        &mut self,
        port: u16,
        binding: Option<&NetworkBinding>,
        mut on_packet: F,
    ) -> Result<SocketAddr>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        if self.worker.is_some() {
            bail!("receiver already running");
        }

        let socket = net::bind_udp(port, binding, self.read_timeout)?;
        let local_addr = socket.local_addr()?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let stats = self.stats.clone();
        let (exit_tx, exit_rx) = bounded::<()>(1);

        let spawned = thread::Builder::new()
            .name("thirdeye-recv".into())
            .spawn(move || {
                let _exit = exit_tx;
                let mut buf = vec![0u8; MAX_DATAGRAM];
                while running.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((0, _)) => {}
                        Ok((len, _from)) => {
                            stats.record_packet(len);
                            on_packet(Bytes::copy_from_slice(&buf[..len]));
                        }
                        Err(ref e)
                            if e.kind() == ErrorKind::WouldBlock
                                || e.kind() == ErrorKind::TimedOut
                                || e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            if !running.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!(error = %e, "UDP receive failed");
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
                debug!("receive thread exiting");
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                bail!("failed to spawn receive thread: {e}");
            }
        };

        info!(%local_addr, binding = ?binding.map(|b| b.to_string()), "receiver started");
        self.worker = Some(ReceiveWorker {
            handle,
            exited: exit_rx,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop the receive thread, waiting at most the shutdown timeout.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.exited.recv_timeout(self.shutdown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("receive thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "receive thread did not stop in time, detaching"
                );
            }
        }
        info!(addr = %worker.local_addr, "receiver stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::Acquire)
    }

    /// `(packets, bytes)` received so far.
    pub fn stats(&self) -> (u64, u64) {
        (self.stats.packets_received(), self.stats.bytes_received())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(|w| w.local_addr)
    }
}

impl Drop for PacketReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::time::Instant;

    fn loopback() -> NetworkBinding {
        NetworkBinding::Address(Ipv4Addr::LOCALHOST.into())
    }

    #[test]
    fn delivers_datagrams_in_order() {
        let mut rx = PacketReceiver::new(Arc::new(PipelineStats::new()));
        let (tx, got) = unbounded();
        let addr = rx
            .start(0, Some(&loopback()), move |b| {
                let _ = tx.send(b);
            })
            .unwrap();
        assert!(rx.is_running());

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for n in 0..5u8 {
            sender.send_to(&[n; 10], addr).unwrap();
        }
        let received: Vec<Bytes> = (0..5)
            .map(|_| got.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        for (n, b) in received.iter().enumerate() {
            assert_eq!(b.len(), 10);
            assert_eq!(b[0], n as u8);
        }
        assert_eq!(rx.stats(), (5, 50));
        rx.stop();
    }

    #[test]
    fn large_datagram_is_copied_exactly() {
        let mut rx = PacketReceiver::new(Arc::new(PipelineStats::new()));
        let (tx, got) = unbounded();
        let addr = rx
            .start(0, Some(&loopback()), move |b| {
                let _ = tx.send(b);
            })
            .unwrap();
        let payload: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .send_to(&payload, addr)
            .unwrap();
        let b = got.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&b[..], &payload[..]);
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let mut rx = PacketReceiver::new(Arc::new(PipelineStats::new()));
        rx.start(0, Some(&loopback()), |_| {}).unwrap();
        let started = Instant::now();
        rx.stop();
        rx.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!rx.is_running());
        assert!(rx.local_addr().is_none());
    }

    #[test]
    fn double_start_is_rejected() {
        let mut rx = PacketReceiver::new(Arc::new(PipelineStats::new()));
        rx.start(0, Some(&loopback()), |_| {}).unwrap();
        assert!(rx.start(0, Some(&loopback()), |_| {}).is_err());
    }

    #[test]
    fn can_restart_after_stop() {
        let mut rx = PacketReceiver::new(Arc::new(PipelineStats::new()));
        rx.start(0, Some(&loopback()), |_| {}).unwrap();
        rx.stop();
        assert!(rx.start(0, Some(&loopback()), |_| {}).is_ok());
    }
}
