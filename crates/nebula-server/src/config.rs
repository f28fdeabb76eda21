//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (first of `nebula.toml`, `/etc/nebula/nebula.toml`,
//!   `~/.config/nebula/nebula.toml`)
//! - Environment variables (`NEBULA_*`, nested keys joined with `__`, e.g.
//!   `NEBULA_PRESENCE__TTL_SECS=15`)

use anyhow::{ensure, Context, Result};
use nebula_core::gateway::GatewayConfig;
use nebula_core::store::{KeySpace, DEFAULT_KEY_PREFIX};
use nebula_core::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration file search path, first match wins.
const CONFIG_PATHS: [&str; 3] = [
    "nebula.toml",
    "/etc/nebula/nebula.toml",
    "~/.config/nebula/nebula.toml",
];

/// Environment variable prefix.
const ENV_PREFIX: &str = "NEBULA";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared store URL. Without one, presence and broadcast stay in-process.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Per-connection rate limit.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Namespace for presence records, the counter and the broadcast channel.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Presence record TTL in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Timeout for a single store operation in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum rooms per connection.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4001
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_store_timeout() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_rooms() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            redis_url: None,
            presence: PresenceConfig::default(),
            rate_limit: RateLimitConfig::default(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms_per_connection: default_max_rooms(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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
    /// Load configuration from the first config file found and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is
    /// invalid.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::load_from(file.as_deref(), config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Load configuration from an optional TOML file overlaid with the given
    /// environment source.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is
    /// invalid.
    pub fn load_from(file: Option<&str>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            tracing::info!(path, "Loading configuration file");
            builder = builder.add_source(config::File::new(path, config::FileFormat::Toml));
        }

        let config: Config = builder
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, without the environment.
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

        config.validate()?;
        Ok(config)
    }

    /// Reject values the gateway cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.presence.ttl_secs > 0, "presence.ttl_secs must be positive");
        ensure!(self.rate_limit.burst >= 1, "rate_limit.burst must be at least 1");
        ensure!(
            self.rate_limit.refill_per_sec > 0.0,
            "rate_limit.refill_per_sec must be positive"
        );
        ensure!(
            self.transport.websocket_path.starts_with('/'),
            "transport.websocket_path must start with '/'"
        );
        ensure!(self.heartbeat.timeout_ms > 0, "heartbeat.timeout_ms must be positive");
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Key namespace for the shared store.
    #[must_use]
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.presence.key_prefix.clone())
    }

    /// Timeout for a single store operation.
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.presence.store_timeout_ms)
    }

    /// How long a connection may stay silent before it is closed.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    /// Gateway settings derived from this configuration.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            rate_limit: self.rate_limit,
            presence_ttl: Duration::from_secs(self.presence.ttl_secs),
            max_connections: self.limits.max_connections,
            max_rooms_per_connection: self.limits.max_rooms_per_connection,
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
        }
    }
}
