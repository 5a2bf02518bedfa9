//! Typed values to envelopes and back.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::envelope::Envelope;
use crate::codec::format::PayloadFormat;
use crate::codec::headers::{self, Headers};
use crate::error::{BusError, Result};

/// Schema identity of a message type.
///
/// The default identity is the Rust type name. Override `schema_name` when
/// the identity must stay stable across crate renames or be shared with
/// workers written elsewhere.
pub trait Schema {
    fn schema_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl Schema for String {
    fn schema_name() -> &'static str {
        "string"
    }
}

impl Schema for serde_json::Value {
    fn schema_name() -> &'static str {
        "json"
    }
}

impl Schema for () {
    fn schema_name() -> &'static str {
        "unit"
    }
}

/// Converts typed values to envelopes and back.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    format: PayloadFormat,
    headers_enabled: bool,
}

impl Codec {
    pub fn new(format: PayloadFormat, headers_enabled: bool) -> Self {
        Self { format, headers_enabled }
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn headers_enabled(&self) -> bool {
        self.headers_enabled
    }

    /// Encode a value into a payload without headers.
    pub fn encode<T: Serialize + Schema>(&self, value: &T) -> Result<bytes::Bytes> {
        self.format.encode(value, T::schema_name())
    }

    /// Headers describing a payload of type `T` in this codec's format.
    pub fn headers_for<T: Schema>(&self) -> Headers {
        let mut headers = Headers::new();
        if self.headers_enabled {
            headers.insert(headers::CONTENT_TYPE, self.format.content_type());
            headers.insert(headers::MESSAGE_TYPE, T::schema_name());
        }
        headers
    }

    /// Encode a value into an envelope carrying content-type and schema headers.
    pub fn encode_envelope<T: Serialize + Schema>(&self, value: &T) -> Result<Envelope> {
        let payload = self.encode(value)?;
        Ok(Envelope::new(payload).with_headers(self.headers_for::<T>()))
    }

    /// Decode an envelope as `T`.
    ///
    /// When the sender attached a `message-type` header it must match
    /// `T::schema_name()`; the sender's `content-type` selects the format.
    pub fn decode_envelope<T: DeserializeOwned + Schema>(&self, envelope: &Envelope) -> Result<T> {
        self.check_schema(envelope, T::schema_name())?;

        let format = envelope
            .headers
            .get(headers::CONTENT_TYPE)
            .and_then(PayloadFormat::from_content_type)
            .unwrap_or(self.format);

        format.decode(&envelope.payload, T::schema_name())
    }

    /// Reject an envelope whose schema header names a different type.
    pub fn check_schema(&self, envelope: &Envelope, expected: &str) -> Result<()> {
        match envelope.message_type() {
            Some(actual) if actual != expected => Err(BusError::Deserialization {
                schema: expected.to_string(),
                reason: format!("schema mismatch: message carries '{}'", actual),
            }),
            _ => Ok(()),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(PayloadFormat::default(), true)
    }
}
