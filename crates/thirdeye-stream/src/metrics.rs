//! # Status Server
//!
//! Renders session statistics in Prometheus text exposition format and
//! serves them, together with JSON status and the latest frame, from a
//! lightweight HTTP server.
//!
//! | Path         | Body                                   |
//! |--------------|----------------------------------------|
//! | `/metrics`   | Prometheus text                        |
//! | `/stats`     | [`StreamStats`] as JSON                |
//! | `/health`    | `{"status":"ok","streaming":...}`      |
//! | `/frame.jpg` | JPEG of the latest frame (404 if none) |
//! | `/stream`    | MJPEG, `multipart/x-mixed-replace`     |
//!
//! Each `/stream` viewer gets its own thread and is counted in
//! [`StreamStats::clients`] while connected.

use crate::session::StreamSession;
use crate::stats::StreamStats;
use crate::surface::OutputSurface;
use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Concurrent `/stream` viewers; further requests get 503.
pub const MAX_STREAM_CLIENTS: usize = 16;

/// Multipart boundary used by `/stream`.
const BOUNDARY: &str = "frame";

/// How often a viewer thread looks for a new frame.
const STREAM_POLL: Duration = Duration::from_millis(10);

/// An unchanged frame is re-sent this often so dead viewers are noticed.
const STREAM_KEEPALIVE: Duration = Duration::from_millis(500);

/// Render a stats snapshot as Prometheus text exposition format.
pub fn render_prometheus(stats: &StreamStats) -> String {
    let mut out = String::with_capacity(1024);

    let counters: [(&str, &str, u64); 5] = [
        (
            "thirdeye_packets_received_total",
            "UDP datagrams received.",
            stats.packets_received,
        ),
        (
            "thirdeye_bytes_received_total",
            "UDP payload bytes received.",
            stats.bytes_received,
        ),
        (
            "thirdeye_nal_units_total",
            "NAL units recovered from the byte stream.",
            stats.nal_units_found,
        ),
        (
            "thirdeye_frames_decoded_total",
            "Frames released to the output surface.",
            stats.frames_decoded,
        ),
        (
            "thirdeye_frames_dropped_total",
            "NAL units dropped before reaching the decoder.",
            stats.frames_dropped,
        ),
    ];
    for (name, help, value) in counters {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(out, "{name} {value}");
    }

    let _ = writeln!(
        out,
        "# HELP thirdeye_streaming Whether the session is streaming (1) or stopped (0)."
    );
    let _ = writeln!(out, "# TYPE thirdeye_streaming gauge");
    let _ = writeln!(out, "thirdeye_streaming {}", u8::from(stats.is_streaming));

    let _ = writeln!(
        out,
        "# HELP thirdeye_decoder_state Decoder bridge state, labelled by name."
    );
    let _ = writeln!(out, "# TYPE thirdeye_decoder_state gauge");
    let _ = writeln!(
        out,
        "thirdeye_decoder_state{{state=\"{}\"}} 1",
        stats.decoder_state
    );

    let _ = writeln!(out, "# HELP thirdeye_uptime_seconds Seconds since start.");
    let _ = writeln!(out, "# TYPE thirdeye_uptime_seconds gauge");
    let _ = writeln!(out, "thirdeye_uptime_seconds {:.3}", stats.uptime_secs);

    let _ = writeln!(
        out,
        "# HELP thirdeye_decode_fps Frames decoded per second of uptime."
    );
    let _ = writeln!(out, "# TYPE thirdeye_decode_fps gauge");
    let _ = writeln!(out, "thirdeye_decode_fps {:.3}", stats.decode_fps);

    let _ = writeln!(
        out,
        "# HELP thirdeye_drop_rate Fraction of NAL units dropped before decode."
    );
    let _ = writeln!(out, "# TYPE thirdeye_drop_rate gauge");
    let _ = writeln!(out, "thirdeye_drop_rate {:.4}", stats.drop_rate());

    let _ = writeln!(out, "# HELP thirdeye_stream_clients Connected MJPEG viewers.");
    let _ = writeln!(out, "# TYPE thirdeye_stream_clients gauge");
    let _ = writeln!(out, "thirdeye_stream_clients {}", stats.clients);

    out
}

/// Health document served at `/health`.
pub fn health_json(stats: &StreamStats) -> String {
    serde_json::json!({
        "status": "ok",
        "streaming": stats.is_streaming,
        "decoder_state": stats.decoder_state,
    })
    .to_string()
}

/// HTTP server for scraping and status checks.
///
/// Runs in a background thread and reads directly from the session.
pub struct MetricsServer {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Start serving on `bind_addr`.
    pub fn start(bind_addr: SocketAddr, session: Arc<StreamSession>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("thirdeye-metrics".into())
            .spawn(move || {
                serve_loop(listener, session, running_clone);
            })
            .map_err(std::io::Error::other)?;

        debug!(%addr, "metrics server listening");
        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the server. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("metrics thread panicked");
            }
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(listener: TcpListener, session: Arc<StreamSession>, running: Arc<AtomicBool>) {
    let mut viewers: Vec<thread::JoinHandle<()>> = Vec::new();
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                viewers.retain(|h| !h.is_finished());
                if let Some(viewer) = handle_connection(stream, &session, &running, viewers.len())
                {
                    viewers.push(viewer);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    for viewer in viewers {
        if viewer.join().is_err() {
            warn!("stream viewer thread panicked");
        }
    }
}

fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
}

/// Serve one request. `/stream` hands the socket to a new viewer thread,
/// returned so the server can join it on shutdown.
fn handle_connection(
    mut stream: TcpStream,
    session: &Arc<StreamSession>,
    running: &Arc<AtomicBool>,
    viewers: usize,
) -> Option<thread::JoinHandle<()>> {
    // Accepted sockets may inherit non-blocking mode from the listener.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return None,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("");

    match path {
        "/metrics" => {
            let body = render_prometheus(&session.get_stats());
            respond(
                &mut stream,
                "200 OK",
                "text/plain; version=0.0.4; charset=utf-8",
                body.as_bytes(),
            );
        }
        "/stats" => match serde_json::to_vec(&session.get_stats()) {
            Ok(body) => respond(&mut stream, "200 OK", "application/json", &body),
            Err(_) => respond(&mut stream, "500 Internal Server Error", "text/plain", b""),
        },
        "/health" => {
            let body = health_json(&session.get_stats());
            respond(&mut stream, "200 OK", "application/json", body.as_bytes());
        }
        "/frame.jpg" => match session.capture_current_frame() {
            Some(jpeg) => respond(&mut stream, "200 OK", "image/jpeg", &jpeg),
            None => respond(&mut stream, "404 Not Found", "text/plain", b"no frame"),
        },
        "/stream" if viewers >= MAX_STREAM_CLIENTS => {
            respond(&mut stream, "503 Service Unavailable", "text/plain", b"too many viewers");
        }
        "/stream" => {
            let session = session.clone();
            let running = running.clone();
            let spawned = thread::Builder::new()
                .name("thirdeye-mjpeg".into())
                .spawn(move || stream_mjpeg(stream, &session, &running));
            match spawned {
                Ok(handle) => return Some(handle),
                Err(e) => warn!(error = %e, "failed to spawn stream viewer"),
            }
        }
        _ => respond(&mut stream, "404 Not Found", "text/plain", b""),
    }
    None
}

/// Push every new frame to one viewer until it disconnects or the server
/// stops.
fn stream_mjpeg(mut stream: TcpStream, session: &StreamSession, running: &AtomicBool) {
    let _client = session.connect_client();
    let peer = stream.peer_addr().ok();
    info!(?peer, clients = session.get_stats().clients, "stream viewer connected");

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={BOUNDARY}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n"
    );
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    let surface = session.surface();
    let mut last_pts = None;
    let mut jpeg: Option<Vec<u8>> = None;
    let mut last_sent = Instant::now();
    while running.load(Ordering::Relaxed) {
        if let Some(frame) = surface.snapshot() {
            if last_pts != Some(frame.pts_us) {
                match frame.to_jpeg(session.jpeg_quality()) {
                    Ok(encoded) => jpeg = Some(encoded),
                    Err(e) => debug!(error = %e, "stream frame not encodable"),
                }
                last_pts = Some(frame.pts_us);
                if let Some(jpeg) = &jpeg {
                    if write_part(&mut stream, jpeg).is_err() {
                        break;
                    }
                    last_sent = Instant::now();
                }
            }
        }
        if last_sent.elapsed() >= STREAM_KEEPALIVE {
            if let Some(jpeg) = &jpeg {
                if write_part(&mut stream, jpeg).is_err() {
                    break;
                }
            }
            last_sent = Instant::now();
        }
        thread::sleep(STREAM_POLL);
    }
    info!(?peer, "stream viewer disconnected");
}

fn write_part(stream: &mut TcpStream, jpeg: &[u8]) -> std::io::Result<()> {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stats() -> StreamStats {
        StreamStats {
            packets_received: 120,
            bytes_received: 96_000,
            nal_units_found: 40,
            frames_decoded: 30,
            frames_dropped: 2,
            is_streaming: true,
            decoder_state: "running".into(),
            uptime_secs: 3.0,
            decode_fps: 10.0,
            clients: 2,
        }
    }

    fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        write!(stream, "GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[test]
    fn prometheus_contains_all_series() {
        let text = render_prometheus(&sample_stats());
        assert!(text.contains("thirdeye_packets_received_total 120"));
        assert!(text.contains("thirdeye_bytes_received_total 96000"));
        assert!(text.contains("thirdeye_nal_units_total 40"));
        assert!(text.contains("thirdeye_frames_decoded_total 30"));
        assert!(text.contains("thirdeye_frames_dropped_total 2"));
        assert!(text.contains("thirdeye_streaming 1"));
        assert!(text.contains("thirdeye_decoder_state{state=\"running\"} 1"));
        assert!(text.contains("thirdeye_decode_fps 10.000"));
        assert!(text.contains("# TYPE thirdeye_frames_decoded_total counter"));
        assert!(text.contains("thirdeye_drop_rate 0.0500"));
        assert!(text.contains("thirdeye_stream_clients 2"));
    }

    #[test]
    fn health_reports_state() {
        let v: serde_json::Value = serde_json::from_str(&health_json(&sample_stats())).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["streaming"], true);
        assert_eq!(v["decoder_state"], "running");
    }

    #[test]
    fn server_routes() {
        let session = Arc::new(StreamSession::default());
        let mut server =
            MetricsServer::start("127.0.0.1:0".parse().unwrap(), session.clone()).unwrap();
        let addr = server.addr();

        let metrics = get(addr, "/metrics");
        assert!(metrics.starts_with("HTTP/1.1 200 OK"));
        assert!(metrics.contains("thirdeye_streaming 0"));

        let stats = get(addr, "/stats");
        assert!(stats.contains("\"packets_received\":0"));

        let health = get(addr, "/health");
        assert!(health.contains("\"status\":\"ok\""));

        let frame = get(addr, "/frame.jpg");
        assert!(frame.starts_with("HTTP/1.1 404"));

        let missing = get(addr, "/nope");
        assert!(missing.starts_with("HTTP/1.1 404"));

        server.stop();
        server.stop();
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn stream_serves_mjpeg_and_counts_viewers() {
        use crate::surface::{OutputSurface, VideoFrame};

        let session = Arc::new(StreamSession::default());
        session
            .surface()
            .present(VideoFrame::solid(16, 16, [10, 20, 30], 1).unwrap());
        let mut server =
            MetricsServer::start("127.0.0.1:0".parse().unwrap(), session.clone()).unwrap();

        let mut client = TcpStream::connect(server.addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        write!(client, "GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();

        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        let first_part = loop {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "stream closed early");
            received.extend_from_slice(&chunk[..n]);
            if let Some(start) = find(&received, &[0xFF, 0xD8]) {
                break start;
            }
        };

        let text = String::from_utf8_lossy(&received[..first_part]);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
        assert!(text.contains("--frame\r\nContent-Type: image/jpeg"));
        assert!(wait_for(|| session.get_stats().clients == 1));

        let stats = get(server.addr(), "/stats");
        assert!(stats.contains("\"clients\":1"));

        drop(client);
        assert!(wait_for(|| session.get_stats().clients == 0));
        server.stop();
    }

    #[test]
    fn stream_viewers_stop_with_server() {
        let session = Arc::new(StreamSession::default());
        let mut server =
            MetricsServer::start("127.0.0.1:0".parse().unwrap(), session.clone()).unwrap();
        let mut client = TcpStream::connect(server.addr()).unwrap();
        write!(client, "GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        assert!(wait_for(|| session.get_stats().clients == 1));

        let started = Instant::now();
        server.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.get_stats().clients, 0);
    }
}
