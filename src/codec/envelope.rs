//! The unit handed to and received from the transport.

use bytes::Bytes;

use crate::codec::headers::{self, Headers};

/// Encoded payload plus routing metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Opaque encoded payload.
    pub payload: Bytes,
    /// Message headers (schema identity, trace context, idempotency key).
    pub headers: Headers,
    /// Address the receiver should reply to, if any.
    pub reply_to: Option<String>,
}

impl Envelope {
    /// Create an envelope with no headers and no reply address.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: Headers::new(),
            reply_to: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Schema identity carried in the headers, if any.
    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_TYPE)
    }

    /// Idempotency key carried in the headers, if any.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.headers.get(headers::MSG_ID)
    }
}
