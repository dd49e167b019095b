//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{GatekeeperError, Result};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER_SERVER__GRPC_ADDR`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where policies are persisted
    #[serde(default)]
    pub policy_store: PolicyStoreConfig,

    /// Where window counters live
    #[serde(default)]
    pub counter_store: CounterStoreConfig,

    /// Event publishing
    #[serde(default)]
    pub events: EventsConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Policy store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyBackend {
    /// Process-local map, lost on restart
    #[default]
    Memory,
    /// SQLite database file
    Sqlite,
}

/// Policy store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyStoreConfig {
    /// Backend to use
    #[serde(default)]
    pub backend: PolicyBackend,

    /// Database file for the sqlite backend
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,

    /// How long sqlite waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for PolicyStoreConfig {
    fn default() -> Self {
        Self {
            backend: PolicyBackend::default(),
            path: default_sqlite_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("gatekeeper.db")
}

fn default_busy_timeout() -> u64 {
    5000
}

/// Counter store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    /// Process-local sharded map
    #[default]
    Memory,
    /// Redis server (requires the `redis-store` feature)
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterStoreConfig {
    /// Backend to use
    #[serde(default)]
    pub backend: CounterBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the memory backend drops expired windows
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::default(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

/// Event publishing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Write every event to the log
    #[serde(default = "default_true")]
    pub log: bool,

    /// Buffered events per `WatchEvents` subscriber before it starts lagging
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            log: default_true(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_broadcast_capacity() -> usize {
    1024
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, layered under environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))
    }
}
