//! Fehler- und Ergebnis-Typen für Verbindungen und Peers.

use std::time::Duration;

use auth::AuthError;
use network_shared::{PayloadError, UnitKind};
use thiserror::Error;

use crate::subscription::StoreError;

/// Transport and protocol failures of a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is not connected")]
    NotConnected,
    #[error("connection closed before a response arrived")]
    Closed,
    #[error("{packet} request timed out after {after:?}")]
    Timeout {
        packet: &'static str,
        after: Duration,
    },
    #[error("write failed: {0}")]
    Write(String),
    #[error("authentication failed: {0}")]
    Unauthenticated(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
}

/// One subscriber that could not be notified during a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutFailure {
    pub address: String,
    pub receiver: String,
    pub error: String,
}

fn summarize(failures: &[FanoutFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}/{} ({})", f.address, f.receiver, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("{kind} '{name}' not found")]
    UnitNotFound { kind: UnitKind, name: String },
    #[error("{kind} '{name}' is already registered")]
    DuplicateUnit { kind: UnitKind, name: String },
    #[error("unit name must not be empty")]
    EmptyUnitName,
    #[error("units can only be registered on the local peer")]
    RemoteMutation,
    #[error("operation is only available on the local peer")]
    AccessDenied,
    #[error("peer '{0}' not found")]
    PeerNotFound(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid subscription: {0}")]
    InvalidSubscription(&'static str),
    #[error("{kind} '{name}' failed: {message}")]
    Unit {
        kind: UnitKind,
        name: String,
        message: String,
    },
    #[error(
        "publish of '{action}' failed for {} of {total} subscribers: {}",
        .failures.len(),
        summarize(.failures)
    )]
    PartialPublish {
        action: String,
        total: usize,
        failures: Vec<FanoutFailure>,
    },
    #[error("dial {address}: {reason}")]
    Dial { address: String, reason: String },
    #[error("local peer is shutting down")]
    LocalGone,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl PeerError {
    pub(crate) fn unexpected(expected: &'static str, got: &network_shared::Packet) -> Self {
        PeerError::Connection(ConnectionError::UnexpectedResponse {
            expected,
            got: got.kind(),
        })
    }
}
