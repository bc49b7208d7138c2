//! Bearer token representation: `base64url(claims) "." base64url(signature)`.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use network_shared::serialization::{BincodeSerializer, MessageSerializer};

use crate::claims::Claims;
use crate::error::AuthError;

/// A signed set of claims.
///
/// Keeps the exact bytes that were signed, so verification never depends on
/// re-encoding the decoded claims.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    claims: Claims,
    claims_bytes: Vec<u8>,
    signature: Vec<u8>,
}

impl Token {
    pub(crate) fn from_parts(claims: Claims, claims_bytes: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            claims,
            claims_bytes,
            signature,
        }
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub(crate) fn signed_bytes(&self) -> &[u8] {
        &self.claims_bytes
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&self.claims_bytes),
            URL_SAFE_NO_PAD.encode(&self.signature)
        )
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("claims", &self.claims)
            .field("signature", &"<redacted>")
            .finish()
    }
}

impl FromStr for Token {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (claims_part, sig_part) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("expected '<claims>.<signature>'".into()))?;
        if sig_part.contains('.') {
            return Err(AuthError::Malformed("too many segments".into()));
        }

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_part)
            .map_err(|e| AuthError::Malformed(format!("claims segment: {e}")))?;
        let signature = URL_SAFE_NO_PAD
            .decode(sig_part)
            .map_err(|e| AuthError::Malformed(format!("signature segment: {e}")))?;
        let claims: Claims = BincodeSerializer
            .deserialize(&claims_bytes)
            .map_err(|e| AuthError::Malformed(format!("claims: {e}")))?;

        Ok(Self::from_parts(claims, claims_bytes, signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(matches!(
            "abc".parse::<Token>(),
            Err(AuthError::Malformed(_))
        ));
        assert!(matches!(
            "a.b.c".parse::<Token>(),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_non_base64() {
        assert!(matches!(
            "!!!.???".parse::<Token>(),
            Err(AuthError::Malformed(_))
        ));
    }
}
