//! # Thirdeye Receiver
//!
//! Receives a live H.264 Annex-B stream over UDP, reassembles NAL units and
//! drives a decoder, logging pipeline statistics as it goes.
//!
//! ## Usage
//!
//! ```bash
//! # Monitor mode (count frames, placeholder output)
//! thirdeye-receiver --port 5000
//!
//! # Pin the socket to the camera's Wi-Fi link
//! thirdeye-receiver --port 5000 --iface wlan0
//!
//! # Hardware decode via GStreamer (build with --features gstreamer)
//! thirdeye-receiver --decoder gstreamer --port 5000
//!
//! # Status server and a snapshot on exit
//! thirdeye-receiver --metrics-port 9090 --snapshot last.jpg
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thirdeye_stream::config::ThirdeyeConfig;
use thirdeye_stream::decoder::{factory_for, DecoderBackend};
use thirdeye_stream::metrics::MetricsServer;
use thirdeye_stream::net::NetworkBinding;
use thirdeye_stream::StreamSession;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Configuration ───────────────────────────────────────────
    let args = Cli::parse();
    let mut config = match &args.config {
        Some(path) => ThirdeyeConfig::from_file(path).map_err(anyhow::Error::msg)?,
        None => ThirdeyeConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(iface) = args.iface.as_ref().filter(|s| !s.is_empty()) {
        config.session.binding = Some(NetworkBinding::Interface(iface.clone()));
    }
    if let Some(backend) = &args.decoder {
        config.backend = backend.clone();
    }
    if let Some(port) = args.metrics_port {
        config.metrics_bind = Some(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    tracing::info!(
        port = config.port,
        binding = ?config.session.binding,
        decoder = config.backend.as_str(),
        metrics = ?config.metrics_bind,
        "thirdeye-receiver starting"
    );

    // ── Session ─────────────────────────────────────────────────
    let factory = factory_for(&config.backend, &config.gst_element)?;
    let session = Arc::new(StreamSession::with_decoder(config.session.clone(), factory));
    let addr = session.try_start(config.port)?;
    tracing::info!(%addr, "listening for H.264 stream");

    // ── Status server (optional) ────────────────────────────────
    let mut metrics = match config.metrics_bind {
        Some(bind) => {
            let server = MetricsServer::start(bind, session.clone())?;
            tracing::info!(addr = %server.addr(), "status server started");
            Some(server)
        }
        None => None,
    };

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Main loop: periodic stats ───────────────────────────────
    let stats_interval = Duration::from_secs(5);
    let mut last_stats_log = std::time::Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last_stats_log.elapsed() >= stats_interval {
            let stats = session.get_stats();
            tracing::info!(
                packets = stats.packets_received,
                bytes = stats.bytes_received,
                nal_units = stats.nal_units_found,
                decoded = stats.frames_decoded,
                dropped = stats.frames_dropped,
                drop_rate = stats.drop_rate(),
                fps = stats.decode_fps,
                clients = stats.clients,
                decoder = %stats.decoder_state,
                "stream stats"
            );
            last_stats_log = std::time::Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    if let Some(path) = &args.snapshot {
        match session.capture_current_frame() {
            Some(jpeg) => match std::fs::write(path, &jpeg) {
                Ok(()) => tracing::info!(path = %path.display(), bytes = jpeg.len(), "snapshot written"),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "snapshot write failed"),
            },
            None => tracing::warn!("no frame available for snapshot"),
        }
    }
    if let Some(server) = metrics.as_mut() {
        server.stop();
    }
    session.stop();
    let stats = session.get_stats();
    tracing::info!(
        packets = stats.packets_received,
        decoded = stats.frames_decoded,
        "thirdeye-receiver stopped"
    );

    Ok(())
}

// ─── CLI ────────────────────────────────────────────────────────────────────

/// Live H.264-over-UDP receiver and decoder.
#[derive(Parser, Debug)]
#[command(name = "thirdeye-receiver", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// UDP port to listen on (default: 5000).
    #[arg(long, short, env = "THIRDEYE_PORT")]
    port: Option<u16>,

    /// Bind the socket to a network interface.
    #[arg(long, short, env = "THIRDEYE_IFACE")]
    iface: Option<String>,

    /// Decoder backend: null | gstreamer.
    #[arg(long, short)]
    decoder: Option<DecoderBackend>,

    /// Serve /metrics, /stats, /health, /frame.jpg and /stream on this port.
    #[arg(long, short, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Write the last frame as JPEG on shutdown.
    #[arg(long, short)]
    snapshot: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_short_and_long_flags() {
        let cli = Cli::try_parse_from([
            "thirdeye-receiver",
            "-p",
            "6000",
            "--iface",
            "wlan0",
            "-d",
            "gst",
            "--metrics-port",
            "9090",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(6000));
        assert_eq!(cli.iface.as_deref(), Some("wlan0"));
        assert_eq!(cli.decoder, Some(DecoderBackend::Gstreamer));
        assert_eq!(cli.metrics_port, Some(9090));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(Cli::try_parse_from(["thirdeye-receiver", "--port", "abc"]).is_err());
        assert!(Cli::try_parse_from(["thirdeye-receiver", "--decoder", "ffmpeg"]).is_err());
        assert!(Cli::try_parse_from(["thirdeye-receiver", "--bogus"]).is_err());
    }
}
