use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::IpNet;
use thiserror::Error;
use time::OffsetDateTime;

/// Why a token was refused. Only [`AuthError::OPAQUE`] ever leaves the process.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token expired at {expired_at}")]
    Expired { expired_at: OffsetDateTime },
    #[error("source {source_ip} is outside authorized network {network}")]
    SourceMismatch { source_ip: IpAddr, network: IpNet },
    #[error("claims encode failed: {0}")]
    Encode(String),
}

impl AuthError {
    pub const OPAQUE: &'static str = "authentication failed";

    /// Message sent to the remote side, identical for every failure kind.
    pub fn wire_message(&self) -> &'static str {
        Self::OPAQUE
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret key io '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("secret key '{path}' holds {len} bytes, at least {min} required")]
    TooShort {
        path: PathBuf,
        len: usize,
        min: usize,
    },
    #[error("system random source failed")]
    Random,
}
