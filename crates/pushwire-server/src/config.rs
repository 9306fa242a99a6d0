//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`pushwire.toml`, `/etc/pushwire/pushwire.toml`,
//!   `~/.config/pushwire/pushwire.toml`)
//! - Environment variables (`PUSHWIRE_HOST`, `PUSHWIRE_PORT`) for defaults

use anyhow::{ensure, Context, Result};
use pushwire_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP (Comet) port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Reconnection grace.
    #[serde(default)]
    pub reconnection: ReconnectionConfig,

    /// Outbound payload options.
    #[serde(default)]
    pub payload: PayloadConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix of the Comet endpoints.
    #[serde(default = "default_comet_path")]
    pub comet_path: String,

    /// Enable the Direct socket listener.
    #[serde(default = "default_true")]
    pub direct: bool,

    /// Direct socket port.
    #[serde(default = "default_direct_port")]
    pub direct_port: u16,

    /// Enable the framed WebSocket listener.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Framed WebSocket port.
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    /// Enable the streaming adapter listener.
    #[serde(default)]
    pub adapter: bool,

    /// Streaming adapter port.
    #[serde(default = "default_adapter_port")]
    pub adapter_port: u16,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of registered clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Messages a Comet client queues while disconnected.
    #[serde(default = "default_comet_queue_size")]
    pub comet_queue_size: usize,

    /// Writes buffered per connection before it counts as lost.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Maximum bytes of an incomplete inbound message.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    /// How long a client that lost its connection keeps its subscriptions.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

/// Payload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadConfig {
    /// Stamp server-published payloads with the send time.
    #[serde(default)]
    pub timestamping: bool,

    /// Fan client publishes out to the topic's subscribers.
    #[serde(default = "default_true")]
    pub relay: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    std::env::var("PUSHWIRE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PUSHWIRE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_comet_path() -> String {
    "/streamhub".to_string()
}

fn default_direct_port() -> u16 {
    7979
}

fn default_websocket_port() -> u16 {
    8081
}

fn default_adapter_port() -> u16 {
    7878
}

fn default_max_clients() -> usize {
    10_000
}

fn default_comet_queue_size() -> usize {
    pushwire_core::client::DEFAULT_QUEUE_SIZE
}

fn default_outbound_buffer() -> usize {
    pushwire_transport::channel::DEFAULT_OUTBOUND_BUFFER
}

fn default_max_message_size() -> usize {
    pushwire_core::session::DEFAULT_MAX_PENDING
}

fn default_grace_ms() -> u64 {
    420_000 // 7 minutes
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            reconnection: ReconnectionConfig::default(),
            payload: PayloadConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            comet_path: default_comet_path(),
            direct: true,
            direct_port: default_direct_port(),
            websocket: true,
            websocket_port: default_websocket_port(),
            adapter: false,
            adapter_port: default_adapter_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            comet_queue_size: default_comet_queue_size(),
            outbound_buffer: default_outbound_buffer(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            timestamping: false,
            relay: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "pushwire.toml",
            "/etc/pushwire/pushwire.toml",
            "~/.config/pushwire/pushwire.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check settings that only make sense together.
    ///
    /// A Comet reconnect writes the response preamble and then the whole
    /// queue, so the outbound buffer must hold `comet_queue_size + 1` writes.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        ensure!(limits.max_clients > 0, "limits.max_clients must be at least 1");
        ensure!(
            limits.outbound_buffer > limits.comet_queue_size,
            "limits.outbound_buffer ({}) must exceed limits.comet_queue_size ({}) \
             or every reconnect that flushes a full queue overflows",
            limits.outbound_buffer,
            limits.comet_queue_size
        );
        Ok(())
    }

    /// HTTP (Comet) address.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not a valid IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.addr(self.port)
    }

    /// Direct socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not a valid IP address.
    pub fn direct_addr(&self) -> Result<SocketAddr> {
        self.addr(self.transport.direct_port)
    }

    /// Framed WebSocket address.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not a valid IP address.
    pub fn websocket_addr(&self) -> Result<SocketAddr> {
        self.addr(self.transport.websocket_port)
    }

    /// Streaming adapter address.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not a valid IP address.
    pub fn adapter_addr(&self) -> Result<SocketAddr> {
        self.addr(self.transport.adapter_port)
    }

    fn addr(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.host, port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, port))
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_clients: self.limits.max_clients,
            comet_queue_size: self.limits.comet_queue_size,
            reconnect_grace: Duration::from_millis(self.reconnection.grace_ms),
        }
    }

    /// Comet path prefix without a trailing slash.
    #[must_use]
    pub fn comet_prefix(&self) -> &str {
        self.transport.comet_path.trim_end_matches('/')
    }
}
