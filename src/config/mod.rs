//! Configuration management for stickypool
//!
//! Configuration is loaded from environment variables or a TOML file, then
//! overridden by command-line flags in `main.rs`. Worker processes inherit the
//! master's environment, so both sides resolve the same values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default public port (matches `APP_PORT` default)
pub const DEFAULT_PORT: u16 = 3000;

/// Default drain deadline in seconds
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;

/// Default delay before retrying a failed respawn
pub const DEFAULT_RESPAWN_BACKOFF_MS: u64 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool and public listener
    pub cluster: ClusterConfig,

    /// Graceful shutdown
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Master admin API
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Worker pool and public listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address the public listener binds to
    pub bind_address: IpAddr,

    /// Public port the master accepts client connections on
    pub port: u16,

    /// Number of worker processes
    pub workers: usize,

    /// First direct worker port; worker `n` listens on `worker_port_base + n`
    pub worker_port_base: u16,

    /// Whether each worker binds its own direct port
    pub direct_ports: bool,

    /// Kill a worker that has not reported ready after this many seconds.
    /// Unset means a worker may stay in `spawning` indefinitely.
    pub ready_timeout_secs: Option<u64>,

    /// Delay before retrying a respawn whose process creation failed
    pub respawn_backoff_ms: u64,
}

/// Graceful shutdown configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Time allowed for in-flight connections before they are force-closed
    pub drain_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Admin API configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bind address of the admin API; disabled when unset
    pub bind_address: Option<SocketAddr>,
}

/// Number of CPU cores available to this process
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let port = env_parse::<u16>("APP_PORT").unwrap_or(DEFAULT_PORT);

        let bind_address = env_parse::<IpAddr>("STICKYPOOL_BIND_ADDRESS")
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let workers = env_parse::<usize>("STICKYPOOL_WORKERS").unwrap_or_else(available_cores);

        let worker_port_base = env_parse::<u16>("STICKYPOOL_WORKER_PORT_BASE")
            .unwrap_or_else(|| port.saturating_add(1));

        let direct_ports = env_bool("STICKYPOOL_DIRECT_PORTS").unwrap_or(true);

        let ready_timeout_secs = env_parse::<u64>("STICKYPOOL_READY_TIMEOUT_SECS");

        let respawn_backoff_ms = env_parse::<u64>("STICKYPOOL_RESPAWN_BACKOFF_MS")
            .unwrap_or(DEFAULT_RESPAWN_BACKOFF_MS);

        let drain_timeout_secs = env_parse::<u64>("STICKYPOOL_DRAIN_TIMEOUT_SECS")
            .unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS);

        let admin_address = match std::env::var("STICKYPOOL_ADMIN_ADDR") {
            Ok(addr) if !addr.trim().is_empty() => Some(
                addr.trim()
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid STICKYPOOL_ADMIN_ADDR: {addr}"))?,
            ),
            _ => None,
        };

        let log_level =
            std::env::var("STICKYPOOL_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));
        let log_format =
            std::env::var("STICKYPOOL_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            cluster: ClusterConfig {
                bind_address,
                port,
                workers,
                worker_port_base,
                direct_ports,
                ready_timeout_secs,
                respawn_backoff_ms,
            },
            shutdown: ShutdownConfig { drain_timeout_secs },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
            admin: AdminConfig {
                bind_address: admin_address,
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> crate::error::Result<()> {
        self.cluster.validate()?;

        if self.shutdown.drain_timeout_secs == 0 {
            return Err(crate::error::Error::config("drain_timeout_secs must be greater than 0"));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(crate::error::Error::config(format!(
                "log format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            workers: available_cores(),
            worker_port_base: DEFAULT_PORT + 1,
            direct_ports: true,
            ready_timeout_secs: None,
            respawn_backoff_ms: DEFAULT_RESPAWN_BACKOFF_MS,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl ShutdownConfig {
    /// Drain deadline as Duration
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl ClusterConfig {
    /// Create a new config builder
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Public socket address of the master listener
    pub fn public_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Direct port for the worker at `ordinal`, if direct ports are enabled
    pub fn worker_port(&self, ordinal: usize) -> Option<u16> {
        if !self.direct_ports {
            return None;
        }
        u16::try_from(ordinal)
            .ok()
            .and_then(|offset| self.worker_port_base.checked_add(offset))
    }

    /// Readiness timeout as Duration
    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_secs.map(Duration::from_secs)
    }

    /// Respawn backoff as Duration
    pub fn respawn_backoff(&self) -> Duration {
        Duration::from_millis(self.respawn_backoff_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workers".to_string(),
                reason: "Must run at least 1 worker".to_string(),
            });
        }

        if self.direct_ports {
            let last = self.worker_port(self.workers - 1);
            let Some(last) = last else {
                return Err(ConfigError::InvalidValue {
                    field: "worker_port_base".to_string(),
                    reason: format!(
                        "{} + {} workers exceeds the port range",
                        self.worker_port_base, self.workers
                    ),
                });
            };

            if self.port != 0 && (self.worker_port_base..=last).contains(&self.port) {
                return Err(ConfigError::InvalidValue {
                    field: "worker_port_base".to_string(),
                    reason: format!(
                        "direct worker ports {}..={} overlap the public port {}",
                        self.worker_port_base, last, self.port
                    ),
                });
            }
        }

        if self.ready_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "ready_timeout_secs".to_string(),
                reason: "Timeout must be greater than 0 when set".to_string(),
            });
        }

        Ok(())
    }
}

/// Builder for ClusterConfig
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    bind_address: Option<IpAddr>,
    port: Option<u16>,
    workers: Option<usize>,
    worker_port_base: Option<u16>,
    direct_ports: Option<bool>,
    ready_timeout_secs: Option<u64>,
    respawn_backoff_ms: Option<u64>,
}

impl ClusterConfigBuilder {
    /// Set bind address
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set bind address from string
    pub fn bind_address_str(mut self, addr: &str) -> std::result::Result<Self, ConfigError> {
        self.bind_address = Some(addr.parse().map_err(|_| ConfigError::InvalidValue {
            field: "bind_address".to_string(),
            reason: format!("Invalid address: {}", addr),
        })?);
        Ok(self)
    }

    /// Set public port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set number of workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set first direct worker port
    pub fn worker_port_base(mut self, port: u16) -> Self {
        self.worker_port_base = Some(port);
        self
    }

    /// Enable/disable direct worker ports
    pub fn direct_ports(mut self, enable: bool) -> Self {
        self.direct_ports = Some(enable);
        self
    }

    /// Set readiness timeout
    pub fn ready_timeout_secs(mut self, secs: u64) -> Self {
        self.ready_timeout_secs = Some(secs);
        self
    }

    /// Set respawn backoff
    pub fn respawn_backoff_ms(mut self, ms: u64) -> Self {
        self.respawn_backoff_ms = Some(ms);
        self
    }

    /// Build the config
    pub fn build(self) -> std::result::Result<ClusterConfig, ConfigError> {
        let port = self.port.unwrap_or(DEFAULT_PORT);
        let config = ClusterConfig {
            bind_address: self
                .bind_address
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port,
            workers: self.workers.unwrap_or_else(available_cores),
            worker_port_base: self
                .worker_port_base
                .unwrap_or_else(|| port.saturating_add(1)),
            direct_ports: self.direct_ports.unwrap_or(true),
            ready_timeout_secs: self.ready_timeout_secs,
            respawn_backoff_ms: self.respawn_backoff_ms.unwrap_or(DEFAULT_RESPAWN_BACKOFF_MS),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<ConfigError> for crate::error::Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
