//! Configuration.
//!
//! Settings come from an optional TOML file, then command-line overrides.
//! Every field has a default, so an empty file (or none) is valid.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::upstream::UpstreamAddr;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub routes: RoutesConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening socket settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Upstream resolvers
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Fast resolver trusted for domestic answers
    #[serde(default = "default_local_upstream")]
    pub local: String,
    /// Resolver used when the local answer points abroad
    #[serde(default = "default_remote_upstream")]
    pub remote: String,
    /// Per-query timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutesConfig {
    /// Domestic route table, one `<address>/<prefix>` per line
    #[serde(default = "default_routes_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL in seconds for answers without a positive record TTL
    #[serde(default = "default_ttl")]
    pub default_ttl: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (default: "info")
    /// Options: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Seconds between statistics lines; 0 disables them
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Values given on the command line take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub routes: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl Config {
    /// Load from `path` (defaults when `None`), apply overrides and validate.
    pub fn load(path: Option<&Path>, overrides: CliOverrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };

        config.apply(overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn apply(&mut self, overrides: CliOverrides) {
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(local) = overrides.local {
            self.upstream.local = local;
        }
        if let Some(remote) = overrides.remote {
            self.upstream.remote = remote;
        }
        if let Some(routes) = overrides.routes {
            self.routes.path = routes;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        self.local_upstream()?;
        self.remote_upstream()?;

        if self.cache.default_ttl == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl",
                reason: "must be greater than zero",
            });
        }
        if self.upstream.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "upstream.timeout_ms",
                reason: "must be greater than zero",
            });
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr =
            self.server
                .bind_address
                .parse()
                .map_err(|_| ConfigError::InvalidAddress {
                    field: "server.bind_address",
                    value: self.server.bind_address.clone(),
                })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn local_upstream(&self) -> Result<UpstreamAddr, ConfigError> {
        parse_upstream("upstream.local", &self.upstream.local)
    }

    pub fn remote_upstream(&self) -> Result<UpstreamAddr, ConfigError> {
        parse_upstream("upstream.remote", &self.upstream.remote)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.timeout_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl)
    }
}

fn parse_upstream(field: &'static str, value: &str) -> Result<UpstreamAddr, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::InvalidUpstream { field, source })
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            local: default_local_upstream(),
            remote: default_remote_upstream(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            path: default_routes_path(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    53
}

fn default_local_upstream() -> String {
    "114.114.114.114:53".to_string()
}

fn default_remote_upstream() -> String {
    "127.0.0.1:5300".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_routes_path() -> PathBuf {
    PathBuf::from("chnroutes.txt")
}

fn default_ttl() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    60
}
