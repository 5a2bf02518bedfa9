//! Resilient message-bus client library.
//!
//! Every worker and caller links against this crate to talk to the bus:
//! request/reply with per-destination circuit breakers and bounded retry,
//! durable or best-effort publish, queue-group workers, chunked streaming
//! responses and trace-context propagation.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller                                                      worker
//!   ──────                                                      ──────
//!   request_typed ─▶ codec ─▶ breaker ─▶ ┌────────────┐ ─▶ serve (queue group)
//!                                        │ transport  │        │
//!   ◀── decode ◀── retry/backoff ◀────── │ (one link) │ ◀── reply to inbox
//!                                        └────────────┘
//!   request_stream ─▶ inbox ◀── chunk, chunk, final ◀── serve_stream
//!   publish ─▶ durable (dedup key) / best-effort ─▶ subscribe
//!
//!   connection manager: connect, link events, breaker registry, drain, close
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod transport;

pub use client::{
    BoxError, BusClient, BusClientBuilder, ChunkSender, ChunkStream, HandlerResult,
    RequestContext, RequestOptions, ServeHandle, StreamChunk, SubscriptionHandle,
};
pub use codec::{Codec, Envelope, Headers, PayloadFormat, Schema};
pub use config::BusConfig;
pub use connection::{ConnectionState, ConnectionStats};
pub use error::{BusError, Result};
pub use lifecycle::Shutdown;
pub use resilience::{BreakerState, CircuitBreaker};
pub use transport::{Connector, MemoryBroker, PublishAck, Transport, TransportError};
#[cfg(feature = "nats")]
pub use transport::NatsConnector;
