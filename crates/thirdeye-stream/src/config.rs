use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::decoder::bridge::BridgeConfig;
use crate::decoder::DecoderBackend;
use crate::media::reassembler::ReassemblerConfig;
use crate::net::NetworkBinding;
use crate::session::SessionConfig;

pub const CONFIG_VERSION: u32 = 1;

/// UDP port used when neither the file nor the command line names one.
pub const DEFAULT_PORT: u16 = 5000;

/// Decoder element for the GStreamer backend.
pub const DEFAULT_GST_ELEMENT: &str = "v4l2h264dec";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThirdeyeConfigInput {
    pub version: u32,
    pub receiver: ReceiverConfigInput,
    pub reassembler: ReassemblerConfigInput,
    pub decoder: DecoderConfigInput,
    pub capture: CaptureConfigInput,
    pub metrics: MetricsConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfigInput {
    pub port: Option<u16>,
    pub interface: Option<String>,
    pub bind_address: Option<String>,
    pub read_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReassemblerConfigInput {
    pub sync_loss_limit: Option<usize>,
    pub max_nal_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecoderConfigInput {
    pub backend: Option<String>,
    pub element: Option<String>,
    pub queue_capacity: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub input_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaptureConfigInput {
    pub jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfigInput {
    pub bind: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct ThirdeyeConfig {
    pub version: u32,
    pub port: u16,
    pub session: SessionConfig,
    pub backend: DecoderBackend,
    pub gst_element: String,
    pub metrics_bind: Option<SocketAddr>,
}

impl Default for ThirdeyeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            port: DEFAULT_PORT,
            session: SessionConfig::default(),
            backend: DecoderBackend::Null,
            gst_element: DEFAULT_GST_ELEMENT.to_string(),
            metrics_bind: None,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

impl ThirdeyeConfigInput {
    pub fn resolve(self) -> Result<ThirdeyeConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let defaults = SessionConfig::default();

        // An interface wins over an address when both are set.
        let binding = match (
            non_empty(self.receiver.interface),
            non_empty(self.receiver.bind_address),
        ) {
            (Some(iface), _) => Some(NetworkBinding::Interface(iface)),
            (None, Some(addr)) => Some(NetworkBinding::Address(
                addr.parse::<IpAddr>()
                    .map_err(|e| format!("Invalid receiver.bind_address '{}': {}", addr, e))?,
            )),
            (None, None) => None,
        };

        let reassembler = ReassemblerConfig {
            sync_loss_limit: self
                .reassembler
                .sync_loss_limit
                .unwrap_or(defaults.reassembler.sync_loss_limit)
                .max(1024),
            max_nal_bytes: self
                .reassembler
                .max_nal_bytes
                .unwrap_or(defaults.reassembler.max_nal_bytes)
                .max(64 * 1024),
        };

        let bridge_defaults = BridgeConfig::default();
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);
        let bridge = BridgeConfig {
            queue_capacity: self
                .decoder
                .queue_capacity
                .unwrap_or(bridge_defaults.queue_capacity)
                .max(1),
            poll_interval: ms(self.decoder.poll_interval_ms, bridge_defaults.poll_interval),
            input_timeout: ms(self.decoder.input_timeout_ms, bridge_defaults.input_timeout),
            shutdown_timeout: ms(
                self.decoder.shutdown_timeout_ms,
                bridge_defaults.shutdown_timeout,
            ),
        };

        let read_timeout = ms(self.receiver.read_timeout_ms, defaults.read_timeout);
        if read_timeout.is_zero() {
            return Err("receiver.read_timeout_ms must be greater than 0".into());
        }

        let backend = match non_empty(self.decoder.backend) {
            Some(name) => name.parse::<DecoderBackend>().map_err(|e| e.to_string())?,
            None => DecoderBackend::Null,
        };

        let metrics_bind = match non_empty(self.metrics.bind) {
            Some(addr) => Some(
                addr.parse::<SocketAddr>()
                    .map_err(|e| format!("Invalid metrics.bind '{}': {}", addr, e))?,
            ),
            None => None,
        };

        Ok(ThirdeyeConfig {
            version,
            port: self.receiver.port.unwrap_or(DEFAULT_PORT),
            session: SessionConfig {
                binding,
                read_timeout,
                shutdown_timeout: ms(self.receiver.shutdown_timeout_ms, defaults.shutdown_timeout),
                reassembler,
                bridge,
                jpeg_quality: self
                    .capture
                    .jpeg_quality
                    .unwrap_or(defaults.jpeg_quality)
                    .clamp(1, 100),
            },
            backend,
            gst_element: non_empty(self.decoder.element)
                .unwrap_or_else(|| DEFAULT_GST_ELEMENT.to_string()),
            metrics_bind,
        })
    }
}

impl ThirdeyeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ThirdeyeConfig::default());
        }
        let parsed: ThirdeyeConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&text)
    }
}
