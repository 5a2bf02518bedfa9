//! Error taxonomy surfaced to callers of the SDK.

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors returned by the client, dispatcher and streaming consumer.
#[derive(Debug, Error)]
pub enum BusError {
    /// Payload could not be encoded. Never retried.
    #[error("failed to encode {schema}: {reason}")]
    Serialization { schema: String, reason: String },

    /// Payload was malformed or did not match the expected schema. Never retried.
    #[error("failed to decode {schema}: {reason}")]
    Deserialization { schema: String, reason: String },

    /// No reply arrived within the deadline after exhausting all attempts.
    #[error("no reply from '{destination}' after {attempts} attempt(s) ({timeout_ms}ms each)")]
    ServiceTimeout {
        destination: String,
        attempts: u32,
        timeout_ms: u64,
    },

    /// The broker reported that nothing is subscribed to the destination.
    #[error("no responders for '{destination}'")]
    ServiceUnavailable { destination: String },

    /// The destination's breaker rejected the call before any attempt was made.
    #[error("circuit open for '{destination}'")]
    CircuitOpen { destination: String },

    /// All attempts failed with transport errors; wraps the last one.
    #[error("request to '{destination}' failed after {attempts} attempt(s): {source}")]
    RetryExhausted {
        destination: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The broker could not be reached at startup.
    #[error("connection failed: {reason}")]
    Connection { reason: String },

    /// A publish was rejected by the transport.
    #[error("publish to '{destination}' failed: {source}")]
    Publish {
        destination: String,
        #[source]
        source: TransportError,
    },

    /// A subscription could not be registered.
    #[error("subscribe to '{destination}' failed: {source}")]
    Subscribe {
        destination: String,
        #[source]
        source: TransportError,
    },

    /// The responder terminated the stream with an error chunk.
    #[error("stream from '{destination}' failed: {reason}")]
    Stream { destination: String, reason: String },

    /// The connection is draining or closed and accepts no new work.
    #[error("client is closed")]
    Closed,

    /// Outstanding exchanges did not finish within the drain grace period.
    #[error("drain timed out with {outstanding} exchange(s) outstanding")]
    DrainTimeout { outstanding: u64 },
}

impl BusError {
    /// Short, stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serialization { .. } => "serialization",
            Self::Deserialization { .. } => "deserialization",
            Self::ServiceTimeout { .. } => "timeout",
            Self::ServiceUnavailable { .. } => "unavailable",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Connection { .. } => "connection",
            Self::Publish { .. } => "publish",
            Self::Subscribe { .. } => "subscribe",
            Self::Stream { .. } => "stream",
            Self::Closed => "closed",
            Self::DrainTimeout { .. } => "drain_timeout",
        }
    }
}
