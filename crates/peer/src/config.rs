//! Konfigurationsstrukturen für einen Peer-Host.
//!
//! Loaded from a TOML file (default `peer.toml`). Every section and field is
//! optional; omitted values fall back to the defaults below.
//!
//! Path handling:
//! - Relative paths resolve against the directory containing the config file.
//! - Parent references (`..`) in relative paths are rejected.
//! - Absolute paths are used as-is.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectionSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Log every inbound and outbound envelope.
    pub log_packets: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5243,
            log_packets: false,
        }
    }
}

impl ServiceConfig {
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub secret_key_path: String,
    pub cert_path: String,
    pub key_path: String,
    /// Skip server certificate validation when dialing. Development only.
    pub accept_invalid_certs: bool,
    /// Extra PEM certificates trusted when dialing (e.g. peers' self-signed certs).
    pub trusted_certs: Vec<String>,
    /// Log a loopback-only token with every permission at startup.
    pub issue_dev_token: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key_path: "secret.key".into(),
            cert_path: "server.crt".into(),
            key_path: "server.key".into(),
            accept_invalid_certs: false,
            trusted_certs: Vec::new(),
            issue_dev_token: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub request_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub output_queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            idle_timeout_ms: 10_000,
            dial_timeout_ms: 5_000,
            output_queue_capacity: 100,
            max_frame_bytes: network_shared::messaging::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub peers_path: String,
    /// Omit to keep subscriptions in memory only.
    pub subscriptions_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            peers_path: "peers.toml".into(),
            subscriptions_path: Some("subscriptions.json".into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub service: ServiceConfig,
    pub security: SecurityConfig,
    pub connection: ConnectionConfig,
    pub storage: StorageConfig,
    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl PeerConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut cfg = match fs::read_to_string(path) {
            Ok(text) => toml::from_str::<Self>(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        cfg.base_dir = base_dir;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        if c.output_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "connection.output_queue_capacity must be > 0".into(),
            ));
        }
        if c.request_timeout_ms == 0 || c.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection timeouts must be > 0".into(),
            ));
        }
        if c.max_frame_bytes < 64 {
            return Err(ConfigError::Invalid(
                "connection.max_frame_bytes must be >= 64".into(),
            ));
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        let c = &self.connection;
        ConnectionSettings {
            request_timeout: Duration::from_millis(c.request_timeout_ms),
            idle_timeout: Duration::from_millis(c.idle_timeout_ms),
            output_queue_capacity: c.output_queue_capacity,
            max_frame_bytes: c.max_frame_bytes,
            log_packets: self.service.log_packets,
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.dial_timeout_ms)
    }

    /// Resolve a configured path against [`PeerConfig::base_dir`].
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ConfigError> {
        let path = Path::new(raw);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ConfigError::Invalid(format!(
                "parent directory segments ('..') not allowed in relative path: {raw}"
            )));
        }
        Ok(self.base_dir.join(path))
    }
}
