//! One-way publish and per-message subscriptions.
//!
//! # Responsibilities
//! - Durable publish with dedup key forwarding, or best-effort publish
//! - Subscribe with a typed handler, isolated per message
//!
//! # Design Decisions
//! - Best-effort publish never waits for or checks subscriber presence
//! - Handler errors, panics and undecodable messages are logged and counted;
//!   the dispatch loop keeps running
//! - Messages on one subscription are handled in arrival order

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::client::{panic_message, within_trace, BusClient, ClientInner, HandlerResult};
use crate::codec::headers::MSG_ID;
use crate::codec::{Envelope, Headers, Schema};
use crate::error::{BusError, Result};
use crate::observability::metrics;
use crate::transport::{IncomingMessage, PublishAck, Subscription};

/// A running subscription. Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    subject: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn new(subject: String, task: JoinHandle<()>) -> Self {
        Self { subject, task }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether the dispatch loop is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop receiving now instead of at drop.
    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl BusClient {
    /// Publish a typed event.
    ///
    /// Returns the broker acknowledgment when durable publish is enabled,
    /// `None` for best-effort publish.
    pub async fn publish<T>(
        &self,
        destination: &str,
        value: &T,
        dedup_key: Option<&str>,
    ) -> Result<Option<PublishAck>>
    where
        T: Serialize + Schema,
    {
        let payload = self.inner.codec.encode(value)?;
        let envelope = Envelope::new(payload).with_headers(self.inner.outgoing_headers::<T>());
        self.publish_raw(destination, envelope, dedup_key).await
    }

    /// Publish a pre-encoded envelope.
    pub async fn publish_raw(
        &self,
        destination: &str,
        mut envelope: Envelope,
        dedup_key: Option<&str>,
    ) -> Result<Option<PublishAck>> {
        let _in_flight = self.inner.connection.begin()?;
        let transport = self.inner.connection.transport();

        if !self.inner.durable_publish {
            return match transport.publish(destination, envelope).await {
                Ok(()) => {
                    metrics::record_publish(destination, "best_effort", "ok");
                    Ok(None)
                }
                Err(source) => {
                    metrics::record_publish(destination, "best_effort", "error");
                    tracing::warn!(destination = %destination, error = %source, "Publish failed");
                    Err(BusError::Publish {
                        destination: destination.to_string(),
                        source,
                    })
                }
            };
        }

        if let Some(key) = dedup_key {
            envelope.headers.insert(MSG_ID, key);
        }
        match transport.publish_durable(destination, envelope, dedup_key).await {
            Ok(ack) => {
                let outcome = if ack.duplicate { "duplicate" } else { "ok" };
                metrics::record_publish(destination, "durable", outcome);
                if ack.duplicate {
                    tracing::debug!(
                        destination = %destination,
                        dedup_key = ?dedup_key,
                        sequence = ack.sequence,
                        "Duplicate publish suppressed by broker"
                    );
                }
                Ok(Some(ack))
            }
            Err(source) => {
                metrics::record_publish(destination, "durable", "error");
                tracing::warn!(destination = %destination, error = %source, "Durable publish failed");
                Err(BusError::Publish {
                    destination: destination.to_string(),
                    source,
                })
            }
        }
    }

    /// Invoke `handler(message, headers, reply_to)` for every message on `destination`.
    ///
    /// `destination` may be a wildcard pattern when the transport supports it.
    pub async fn subscribe<T, F, Fut>(&self, destination: &str, handler: F) -> Result<SubscriptionHandle>
    where
        T: DeserializeOwned + Schema + Send + 'static,
        F: Fn(T, Headers, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        if self.inner.connection.shutdown_signal().is_triggered() {
            return Err(BusError::Closed);
        }
        let subscription = self
            .inner
            .connection
            .transport()
            .subscribe(destination, None)
            .await
            .map_err(|source| BusError::Subscribe {
                destination: destination.to_string(),
                source,
            })?;

        tracing::info!(destination = %destination, "Subscribed");
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.inner),
            subscription,
            Arc::new(handler),
        ));
        Ok(SubscriptionHandle::new(destination.to_string(), task))
    }
}

async fn run_subscription<T, F, Fut>(
    inner: Arc<ClientInner>,
    mut subscription: Subscription,
    handler: Arc<F>,
) where
    T: DeserializeOwned + Schema + Send + 'static,
    F: Fn(T, Headers, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    let shutdown = inner.connection.shutdown_signal().clone();
    let mut stop = shutdown.subscribe();
    if shutdown.is_triggered() {
        return;
    }

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            message = subscription.next() => {
                let Some(message) = message else { break };
                let Ok(_in_flight) = inner.connection.begin() else { break };
                handle_message(&inner, handler.as_ref(), message).await;
            }
        }
    }
    tracing::debug!(destination = %subscription.subject(), "Subscription loop stopped");
}

async fn handle_message<T, F, Fut>(inner: &ClientInner, handler: &F, message: IncomingMessage)
where
    T: DeserializeOwned + Schema,
    F: Fn(T, Headers, Option<String>) -> Fut,
    Fut: Future<Output = HandlerResult<()>>,
{
    let IncomingMessage { subject, envelope } = message;

    let value = match inner.codec.decode_envelope::<T>(&envelope) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(subject = %subject, error = %e, "Dropping undecodable message");
            metrics::record_handler_error(&subject, "decode");
            return;
        }
    };

    let parent = inner.propagator.extract(&envelope.headers);
    let Envelope { headers, reply_to, .. } = envelope;
    let call = async move { handler(value, headers, reply_to).await };
    match within_trace(parent, AssertUnwindSafe(call).catch_unwind()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(subject = %subject, error = %e, "Subscription handler failed");
            metrics::record_handler_error(&subject, "error");
        }
        Err(panic) => {
            tracing::error!(
                subject = %subject,
                panic = %panic_message(panic.as_ref()),
                "Subscription handler panicked"
            );
            metrics::record_handler_error(&subject, "panic");
        }
    }
}
