//! Signed token attributes.

use std::net::IpAddr;

use ipnet::IpNet;
use network_shared::UnitKind;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::permission::Permissions;

/// Operation a token holder may invoke on a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitOperation {
    Run,
    Publish,
    Subscribe,
    Notify,
}

/// Per-unit grant. A `name` of `*` matches every unit of `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub kind: UnitKind,
    pub name: String,
    pub ops: Vec<UnitOperation>,
}

impl Authorization {
    pub const WILDCARD: &'static str = "*";

    pub fn new(kind: UnitKind, name: impl Into<String>, ops: &[UnitOperation]) -> Self {
        Self {
            kind,
            name: name.into(),
            ops: ops.to_vec(),
        }
    }

    fn matches(&self, kind: UnitKind, name: &str, op: UnitOperation) -> bool {
        self.kind == kind
            && (self.name == Self::WILDCARD || self.name == name)
            && self.ops.contains(&op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Source addresses the token may be presented from.
    pub authorized_network: IpNet,
    pub permitted: Permissions,
    /// Empty means no per-unit restriction beyond `permitted`.
    pub authorizations: Vec<Authorization>,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
}

impl Claims {
    pub fn new(authorized_network: IpNet, permitted: Permissions, ttl: Duration) -> Self {
        Self {
            authorized_network,
            permitted,
            authorizations: Vec::new(),
            // Second precision; the wire format stores a unix timestamp.
            expires_at: truncate_to_seconds(OffsetDateTime::now_utc().saturating_add(ttl)),
        }
    }

    pub fn with_authorization(mut self, authorization: Authorization) -> Self {
        self.authorizations.push(authorization);
        self
    }

    pub fn with_expiry(mut self, expires_at: OffsetDateTime) -> Self {
        self.expires_at = truncate_to_seconds(expires_at);
        self
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn allows_source(&self, source: IpAddr) -> bool {
        self.authorized_network.contains(&source.to_canonical())
    }

    pub fn is_authorized(&self, kind: UnitKind, name: &str, op: UnitOperation) -> bool {
        self.authorizations.is_empty()
            || self
                .authorizations
                .iter()
                .any(|a| a.matches(kind, name, op))
    }
}

fn truncate_to_seconds(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(0).unwrap_or(at)
}
