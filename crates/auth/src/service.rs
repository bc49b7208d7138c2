//! Token issuing and verification.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};
use network_shared::serialization::{BincodeSerializer, MessageSerializer};
use ring::hmac;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::claims::Claims;
use crate::error::AuthError;
use crate::permission::Permissions;
use crate::secret::SecretKey;
use crate::token::Token;

/// Lifetime of the development token printed at startup.
pub const DEV_TOKEN_TTL: Duration = Duration::days(30);

/// Outcome of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub permitted: Permissions,
    pub claims: Claims,
}

pub struct AuthService {
    key: hmac::Key,
}

impl AuthService {
    pub fn new(secret: &SecretKey) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    pub fn issue(&self, claims: Claims) -> Result<Token, AuthError> {
        let claims_bytes = BincodeSerializer
            .serialize(&claims)
            .map_err(|e| AuthError::Encode(e.to_string()))?;
        let tag = hmac::sign(&self.key, &claims_bytes);
        Ok(Token::from_parts(
            claims,
            claims_bytes,
            tag.as_ref().to_vec(),
        ))
    }

    /// Token for local development: loopback only, every permission.
    pub fn issue_dev_token(&self) -> Result<Token, AuthError> {
        let loopback = IpNet::V4(Ipv4Net::new([127, 0, 0, 0].into(), 8).map_err(|e| {
            AuthError::Encode(format!("loopback network: {e}"))
        })?);
        self.issue(Claims::new(loopback, Permissions::ALL, DEV_TOKEN_TTL))
    }

    /// Checks the signature only. Uses a constant-time comparison.
    pub fn verify(&self, token: &Token) -> Result<(), AuthError> {
        hmac::verify(&self.key, token.signed_bytes(), token.signature())
            .map_err(|_| AuthError::BadSignature)
    }

    pub fn authenticate(&self, token: &str, source: IpAddr) -> Result<Grant, AuthError> {
        self.authenticate_at(token, source, OffsetDateTime::now_utc())
    }

    /// Full check against an explicit clock: format, signature, expiry, source.
    pub fn authenticate_at(
        &self,
        token: &str,
        source: IpAddr,
        now: OffsetDateTime,
    ) -> Result<Grant, AuthError> {
        let result = self.check(token, source, now);
        match &result {
            Ok(grant) => debug!(
                target: "auth::service",
                "granted {} to {source}", grant.permitted
            ),
            Err(e) => warn!(target: "auth::service", "rejected token from {source}: {e}"),
        }
        result
    }

    fn check(&self, token: &str, source: IpAddr, now: OffsetDateTime) -> Result<Grant, AuthError> {
        let token: Token = token.parse()?;
        self.verify(&token)?;

        let claims = token.claims();
        if claims.is_expired_at(now) {
            return Err(AuthError::Expired {
                expired_at: claims.expires_at,
            });
        }
        if !claims.allows_source(source) {
            return Err(AuthError::SourceMismatch {
                source_ip: source,
                network: claims.authorized_network,
            });
        }

        Ok(Grant {
            permitted: claims.permitted,
            claims: claims.clone(),
        })
    }
}
