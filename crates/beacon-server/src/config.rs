//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - `~/.config/beacon/beacon.toml`
//! - `/etc/beacon/beacon.toml`
//! - `beacon.toml`
//! - Environment variables (`BEACON__PORT`, `BEACON__INDEX__URL`, ...)

use anyhow::{Context, Result};
use beacon_core::IndexConfig;
use beacon_protocol::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Lowest to highest precedence.
const CONFIG_PATHS: [&str; 3] = [
    "~/.config/beacon/beacon.toml",
    "/etc/beacon/beacon.toml",
    "beacon.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Relay identity.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Event index.
    #[serde(default)]
    pub index: IndexSettings,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Relay identity and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Public URL, used to check the `relay` tag of auth events.
    #[serde(default)]
    pub url: Option<String>,

    /// Display name.
    #[serde(default = "default_relay_name")]
    pub name: String,

    /// Reject events from clients that have not authenticated.
    #[serde(default)]
    pub auth_required: bool,
}

/// Which store backs the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Elasticsearch,
    Memory,
}

/// Event index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Store backend.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Store base URL.
    #[serde(default = "default_index_url")]
    pub url: String,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Index and batching settings.
    #[serde(flatten)]
    pub index: IndexConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
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
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7447
}

fn default_relay_name() -> String {
    "beacon".to_string()
}

fn default_index_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            relay: RelayConfig::default(),
            index: IndexSettings::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            name: default_relay_name(),
            auth_required: false,
        }
    }
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_index_url(),
            request_timeout_ms: default_request_timeout(),
            index: IndexConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
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

impl IndexSettings {
    /// HTTP request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            builder = builder.add_source(
                config::File::new(expanded.as_ref(), config::FileFormat::Toml).required(false),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("BEACON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
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

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}
