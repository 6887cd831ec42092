//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (TETHER__*), layered over the file
//! - A config path given as the first command line argument

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tether_core::RetryPolicy;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Endpoints dialed at startup and kept connected.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Reconnect policy for upstreams.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Listeners whose connections join the bridge.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Status endpoint configuration.
    #[serde(default)]
    pub status: StatusConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// A dialed endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `tcp://host:port` or `ws://host[:port]/path`.
    pub url: String,

    /// Header sent on the WebSocket handshake, e.g. `Authorization`.
    #[serde(default)]
    pub header_name: Option<String>,

    /// Value for `header_name`.
    #[serde(default)]
    pub header_value: Option<String>,

    /// Outbound WebSocket message type.
    #[serde(default)]
    pub message_kind: MessageKindConfig,
}

/// WebSocket message type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKindConfig {
    /// Binary frames.
    #[default]
    Binary,
    /// Text frames.
    Text,
}

/// Reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum connect attempts; unset retries forever.
    #[serde(default)]
    pub tries: Option<u32>,

    /// Backoff step in seconds.
    #[serde(default = "default_delay")]
    pub delay: f64,

    /// Backoff ceiling in seconds.
    #[serde(default = "default_max_timeout")]
    pub max_timeout: f64,

    /// Randomize each backoff step.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// Listener configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Raw TCP listener address.
    #[serde(default)]
    pub tcp: Option<String>,

    /// WebSocket listener address.
    #[serde(default)]
    pub websocket: Option<String>,

    /// Outbound message type for accepted WebSocket connections.
    #[serde(default)]
    pub message_kind: MessageKindConfig,
}

/// Status endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Serve `/health`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_status_port")]
    pub port: u16,
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

// Default value functions
fn default_true() -> bool {
    true
}

fn default_delay() -> f64 {
    1.0
}

fn default_max_timeout() -> f64 {
    60.0
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    8081
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tries: None,
            delay: default_delay(),
            max_timeout: default_max_timeout(),
            jitter: true,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_status_port(),
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

impl RetryConfig {
    /// Build the reconnect policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy {
            tries: self.tries,
            ..RetryPolicy::default()
        }
        .with_delay(self.delay)
        .with_max_timeout(self.max_timeout);

        if self.jitter {
            policy
        } else {
            policy.without_jitter()
        }
    }
}

impl StatusConfig {
    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        parse_addr(&format!("{}:{}", self.host, self.port))
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Invalid listen address: {addr}"))
}

impl ListenConfig {
    /// TCP listener address, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is malformed.
    pub fn tcp_addr(&self) -> Result<Option<SocketAddr>> {
        self.tcp.as_deref().map(parse_addr).transpose()
    }

    /// WebSocket listener address, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is malformed.
    pub fn websocket_addr(&self) -> Result<Option<SocketAddr>> {
        self.websocket.as_deref().map(parse_addr).transpose()
    }

    /// Whether any listener is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tcp.is_none() && self.websocket.is_none()
    }
}

impl Config {
    /// Load configuration from the default paths, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];

        let mut builder = ::config::Config::builder();
        if let Some(path) = config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
        {
            builder = builder.add_source(::config::File::from(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("TETHER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
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

        Ok(config)
    }

    /// Check that the configuration describes a usable bridge.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() && self.listen.is_empty() {
            bail!("Nothing to bridge: configure at least one upstream or listener");
        }
        for upstream in &self.upstreams {
            if upstream.header_name.is_some() != upstream.header_value.is_some() {
                bail!(
                    "Upstream {} must set both header_name and header_value",
                    upstream.url
                );
            }
        }
        if self.retry.delay < 0.0 || self.retry.max_timeout < 0.0 {
            bail!("Retry delay and max_timeout must not be negative");
        }
        self.listen.tcp_addr()?;
        self.listen.websocket_addr()?;
        if self.status.enabled {
            self.status.bind_addr()?;
        }
        Ok(())
    }
}
