//! Dynamically typed unit arguments and results.
//!
//! Units accept and return arbitrary values. On the wire such a value is kept
//! as JSON text inside the (binary) envelope, so the envelope schema stays fixed
//! while each unit decides how to interpret its own argument.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("payload does not hold the requested type: {0}")]
    Decode(#[source] serde_json::Error),
}

impl Payload {
    /// The JSON `null` value; used for "no argument" and receiver results.
    pub fn null() -> Self {
        Self(b"null".to_vec())
    }

    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, PayloadError> {
        serde_json::to_vec(value)
            .map(Self)
            .map_err(PayloadError::Encode)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_slice(&self.0).map_err(PayloadError::Decode)
    }

    /// Wraps raw JSON text without validating it.
    pub fn from_json_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0.trim_ascii() == b"null"
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::null()
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        // A JSON string cannot fail to encode.
        Self(serde_json::Value::from(value).to_string().into_bytes())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value.to_string().into_bytes())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => f.write_str(text),
            Err(_) => write!(f, "<{} bytes>", self.0.len()),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({self})")
    }
}
