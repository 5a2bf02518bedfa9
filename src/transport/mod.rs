//! Broker transport abstraction.
//!
//! # Data Flow
//! ```text
//! Connector::connect(options, events)
//!     → Arc<dyn Transport> (one multiplexed physical link)
//!     → ConnectionEvent stream (disconnected / reconnected / closed)
//!
//! Transport:
//!     publish / publish_durable      one-way emission
//!     publish_request                emission that expects a responder
//!     request                        correlated reply on an ephemeral inbox
//!     subscribe(subject, group)      Subscription, released on drop
//! ```
//!
//! # Design Decisions
//! - Any broker with subject-addressed pub/sub, queue groups and ephemeral
//!   reply addresses can implement this trait
//! - Transports never retry; retry policy lives in the request engine
//! - Subscriptions are RAII: dropping one unregisters it from the broker

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod subject;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::Envelope;

pub use memory::{MemoryBroker, MemoryTransport};
#[cfg(feature = "nats")]
pub use nats::{NatsConnector, NatsTransport};

/// Failures reported by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing is subscribed to the subject.
    #[error("no responders")]
    NoResponders,

    /// No reply within the deadline.
    #[error("timed out")]
    TimedOut,

    /// The link is down (a reconnect may be in progress).
    #[error("not connected")]
    Disconnected,

    /// The broker refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The transport was closed by its owner.
    #[error("connection closed")]
    Closed,

    /// The subject is empty, malformed, or a wildcard where a concrete
    /// subject is required.
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("{0}")]
    Other(String),
}

/// Options handed to a [`Connector`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Broker endpoints, tried in order.
    pub servers: Vec<String>,
    /// Client identity reported to the broker.
    pub name: String,
    /// Whether the broker link carries message headers.
    pub headers_enabled: bool,
}

/// Lifecycle notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { server: String },
    Disconnected { reason: String },
    Reconnected { server: String },
    Closed,
}

/// Broker acknowledgment for a durable publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream the message was stored in.
    pub stream: String,
    /// Storage sequence number.
    pub sequence: u64,
    /// True when the broker suppressed storage because the dedup key was seen.
    pub duplicate: bool,
}

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Concrete subject the message was published to.
    pub subject: String,
    pub envelope: Envelope,
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// An active subscription. Dropping it unregisters it from the broker.
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<IncomingMessage>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    /// Build a subscription from a delivery channel and a release hook that
    /// runs exactly once, when the subscription is dropped.
    pub fn new(
        subject: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<IncomingMessage>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            receiver,
            release: Some(Box::new(release)),
        }
    }

    /// Subject (or pattern) this subscription was registered for.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next message. `None` once the broker side is gone.
    pub async fn next(&mut self) -> Option<IncomingMessage> {
        self.receiver.recv().await
    }

    /// Unregister now instead of at drop.
    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = IncomingMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish()
    }
}

/// One physical broker link shared by many logical exchanges.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Best-effort publish. Succeeds whether or not anyone is subscribed.
    async fn publish(&self, subject: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Publish that expects at least one responder. Brokers that can detect
    /// an empty subject return [`TransportError::NoResponders`].
    async fn publish_request(&self, subject: &str, envelope: Envelope)
        -> Result<(), TransportError>;

    /// Persisted publish. The broker suppresses duplicate storage of
    /// messages carrying an already-seen `dedup_key`.
    async fn publish_durable(
        &self,
        subject: &str,
        envelope: Envelope,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, TransportError>;

    /// Send and wait for one correlated reply on an ephemeral inbox.
    async fn request(
        &self,
        subject: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError>;

    /// Subscribe to a subject, optionally as a member of a queue group.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError>;

    /// A fresh, globally unique reply address.
    fn new_inbox(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Release the link. Safe to call more than once.
    async fn close(&self);
}

/// Establishes transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
