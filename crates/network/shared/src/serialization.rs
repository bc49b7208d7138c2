//! Serialisierungs- und Deserialisierungshilfen.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Trait für serialisierbare Nachrichten-Payloads.
pub trait MessageSerializer: Send + Sync + 'static {
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, SerializationError>
    where
        T: Serialize;

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T, SerializationError>
    where
        T: DeserializeOwned;
}

/// Standard-Implementierung basierend auf `bincode`.
///
/// The standard configuration is deterministic for a given value, which the
/// token signer relies on.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl MessageSerializer for BincodeSerializer {
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, SerializationError>
    where
        T: Serialize,
    {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(SerializationError::BincodeEncode)
    }

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T, SerializationError>
    where
        T: DeserializeOwned,
    {
        let (value, len) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(SerializationError::BincodeDecode)?;
        if len != bytes.len() {
            return Err(SerializationError::TrailingBytes {
                consumed: len,
                total: bytes.len(),
            });
        }
        Ok(value)
    }
}

/// Fehler, die bei (De-)Serialisierung auftreten können.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("bincode encode error: {0}")]
    BincodeEncode(bincode::error::EncodeError),
    #[error("bincode decode error: {0}")]
    BincodeDecode(bincode::error::DecodeError),
    #[error("trailing bytes after value ({consumed} of {total} consumed)")]
    TrailingBytes { consumed: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        mask: u32,
    }

    #[test]
    fn encoding_is_deterministic() {
        let s = BincodeSerializer;
        let a = s
            .serialize(&Sample {
                name: "x".into(),
                mask: 7,
            })
            .unwrap();
        let b = s
            .serialize(&Sample {
                name: "x".into(),
                mask: 7,
            })
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_trailing_garbage() {
        let s = BincodeSerializer;
        let mut bytes = s
            .serialize(&Sample {
                name: "x".into(),
                mask: 7,
            })
            .unwrap();
        bytes.push(0xff);
        let err = s.deserialize::<Sample>(&bytes).unwrap_err();
        assert!(matches!(err, SerializationError::TrailingBytes { .. }));
    }
}
