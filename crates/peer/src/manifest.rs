//! Static list of known remote peers.
//!
//! ```toml
//! [[peers]]
//! address = "10.0.0.7:5243"
//! token = "<claims>.<signature>"
//! ```
//!
//! Loaded once when the local peer is built; never reloaded.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Sentinel id of the peer record describing this process.
pub const LOCAL_PEER_ID: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDetails {
    /// Defaults to the address when omitted.
    #[serde(default)]
    pub id: String,
    pub address: String,
    /// Bearer token presented to this peer during the handshake.
    #[serde(default)]
    pub token: String,
}

impl PeerDetails {
    pub fn new(address: impl Into<String>, token: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id: address.clone(),
            address,
            token: token.into(),
        }
    }

    /// Record for this process; it carries no token.
    pub fn local(address: impl Into<String>) -> Self {
        Self {
            id: LOCAL_PEER_ID.to_string(),
            address: address.into(),
            token: String::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCAL_PEER_ID
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersManifest {
    #[serde(default)]
    pub peers: Vec<PeerDetails>,
}

impl PeersManifest {
    /// A missing file is an empty manifest.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut manifest: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: Default::default(),
            source,
        })?;
        for peer in &mut manifest.peers {
            if peer.id.is_empty() {
                peer.id = peer.address.clone();
            }
            if peer.id == LOCAL_PEER_ID {
                return Err(ConfigError::Invalid(format!(
                    "peer id '{LOCAL_PEER_ID}' is reserved (address {})",
                    peer.address
                )));
            }
        }
        Ok(manifest)
    }
}
