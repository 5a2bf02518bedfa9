//! Wire formats for message payloads.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

/// Serialization format applied to payloads.
///
/// Both formats are deterministic for a given value as long as the value does
/// not contain unordered collections (`HashMap`, `HashSet`); use `BTreeMap`
/// in message types that must hash identically across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Self-describing JSON. Missing optional fields decode to serde defaults.
    #[default]
    Json,
    /// Compact positional binary encoding (bincode, standard config).
    Bincode,
}

impl PayloadFormat {
    /// Value written to the `content-type` header.
    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadFormat::Json => "application/json",
            PayloadFormat::Bincode => "application/x-bincode",
        }
    }

    /// Resolve a `content-type` header back to a format.
    pub fn from_content_type(value: &str) -> Option<Self> {
        match value.split(';').next().map(str::trim) {
            Some("application/json") => Some(PayloadFormat::Json),
            Some("application/x-bincode") => Some(PayloadFormat::Bincode),
            _ => None,
        }
    }

    /// Encode a value. `schema` only labels errors.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T, schema: &str) -> Result<Bytes> {
        let bytes = match self {
            PayloadFormat::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            PayloadFormat::Bincode => {
                bincode::serde::encode_to_vec(value, bincode::config::standard())
                    .map_err(|e| e.to_string())
            }
        };

        bytes.map(Bytes::from).map_err(|reason| BusError::Serialization {
            schema: schema.to_string(),
            reason,
        })
    }

    /// Decode a value. `schema` only labels errors.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8], schema: &str) -> Result<T> {
        let decoded = match self {
            PayloadFormat::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            PayloadFormat::Bincode => {
                match bincode::serde::decode_from_slice::<T, _>(bytes, bincode::config::standard())
                {
                    Ok((value, read)) if read == bytes.len() => Ok(value),
                    Ok((_, read)) => Err(format!(
                        "{} trailing byte(s) after payload",
                        bytes.len() - read
                    )),
                    Err(e) => Err(e.to_string()),
                }
            }
        };

        decoded.map_err(|reason| BusError::Deserialization {
            schema: schema.to_string(),
            reason,
        })
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadFormat::Json => write!(f, "json"),
            PayloadFormat::Bincode => write!(f, "bincode"),
        }
    }
}
