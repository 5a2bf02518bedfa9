//! Queue-group request handling.
//!
//! # Data Flow
//! ```text
//! subscribe(destination, group)     one member of the group gets each message
//!     → acquire concurrency permit
//!     → spawn: decode request → handler → encode reply → publish to reply_to
//! ```
//!
//! # Design Decisions
//! - Handler error or panic: logged, no reply; the caller observes a timeout
//!   because the substrate has no negative acknowledgment
//! - Concurrency per served destination is bounded by a semaphore
//! - Messages without `reply_to` are handled and the reply discarded

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::client::{panic_message, within_trace, BusClient, ClientInner, HandlerResult};
use crate::codec::{Envelope, Schema};
use crate::connection::InFlightGuard;
use crate::error::{BusError, Result};
use crate::observability::metrics;
use crate::transport::{IncomingMessage, Subscription};

/// A running queue-group worker. Dropping the handle stops it.
#[derive(Debug)]
pub struct ServeHandle {
    destination: String,
    group: String,
    task: JoinHandle<()>,
}

impl ServeHandle {
    pub(crate) fn new(destination: String, group: String, task: JoinHandle<()>) -> Self {
        Self {
            destination,
            group,
            task,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop serving now instead of at drop. Handlers already running finish.
    pub fn stop(self) {}
}

impl Drop for ServeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl BusClient {
    /// Serve `destination` as a member of `group`, replying with `handler`'s result.
    pub async fn serve<Req, Resp, F, Fut>(
        &self,
        destination: &str,
        group: &str,
        handler: F,
    ) -> Result<ServeHandle>
    where
        Req: DeserializeOwned + Schema + Send + 'static,
        Resp: Serialize + Schema + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Resp>> + Send + 'static,
    {
        let subscription = self.join_group(destination, group).await?;
        let handler = Arc::new(handler);

        let task = spawn_worker_loop(
            Arc::clone(&self.inner),
            subscription,
            move |inner, message, in_flight| {
                let handler = Arc::clone(&handler);
                async move {
                    reply_to_request::<Req, Resp, F, Fut>(&inner, handler.as_ref(), message, in_flight)
                        .await
                }
            },
        );

        tracing::info!(destination = %destination, group = %group, "Serving requests");
        Ok(ServeHandle::new(destination.to_string(), group.to_string(), task))
    }

    /// Subscribe as a queue-group member.
    pub(crate) async fn join_group(&self, destination: &str, group: &str) -> Result<Subscription> {
        if self.inner.connection.shutdown_signal().is_triggered() {
            return Err(BusError::Closed);
        }
        self.inner
            .connection
            .transport()
            .subscribe(destination, Some(group))
            .await
            .map_err(|source| BusError::Subscribe {
                destination: destination.to_string(),
                source,
            })
    }
}

/// Receive from `subscription` until shutdown, spawning `handle` per message
/// under the configured concurrency bound.
pub(crate) fn spawn_worker_loop<H, Fut>(
    inner: Arc<ClientInner>,
    mut subscription: Subscription,
    handle: H,
) -> JoinHandle<()>
where
    H: Fn(Arc<ClientInner>, IncomingMessage, InFlightGuard) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let shutdown = inner.connection.shutdown_signal().clone();
        let mut stop = shutdown.subscribe();
        if shutdown.is_triggered() {
            return;
        }
        let permits = Arc::new(Semaphore::new(inner.dispatch_concurrency));

        loop {
            let message = tokio::select! {
                _ = stop.recv() => break,
                message = subscription.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let Ok(in_flight) = inner.connection.begin() else { break };
            let permit = tokio::select! {
                _ = stop.recv() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let work = handle(Arc::clone(&inner), message, in_flight);
            tokio::spawn(async move {
                work.await;
                drop(permit);
            });
        }
        tracing::debug!(destination = %subscription.subject(), "Worker loop stopped");
    })
}

async fn reply_to_request<Req, Resp, F, Fut>(
    inner: &ClientInner,
    handler: &F,
    message: IncomingMessage,
    _in_flight: InFlightGuard,
) where
    Req: DeserializeOwned + Schema,
    Resp: Serialize + Schema,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = HandlerResult<Resp>>,
{
    let IncomingMessage { subject, envelope } = message;

    let request = match inner.codec.decode_envelope::<Req>(&envelope) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(subject = %subject, error = %e, "Dropping undecodable request");
            metrics::record_handler_error(&subject, "decode");
            return;
        }
    };

    let parent = inner.propagator.extract(&envelope.headers);
    let reply_to = envelope.reply_to;

    let work = async move {
        let call = async move { handler(request).await };
        let response = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(subject = %subject, error = %e, "Request handler failed, not replying");
                metrics::record_handler_error(&subject, "error");
                return;
            }
            Err(panic) => {
                tracing::error!(
                    subject = %subject,
                    panic = %panic_message(panic.as_ref()),
                    "Request handler panicked, not replying"
                );
                metrics::record_handler_error(&subject, "panic");
                return;
            }
        };

        let Some(reply_to) = reply_to else {
            tracing::trace!(subject = %subject, "Request had no reply address");
            return;
        };

        let reply = match inner.codec.encode(&response) {
            Ok(payload) => Envelope::new(payload).with_headers(inner.outgoing_headers::<Resp>()),
            Err(e) => {
                tracing::error!(subject = %subject, error = %e, "Reply could not be encoded");
                metrics::record_handler_error(&subject, "encode");
                return;
            }
        };

        if let Err(e) = inner.connection.transport().publish(&reply_to, reply).await {
            tracing::warn!(subject = %subject, error = %e, "Failed to send reply");
        }
    };

    within_trace(parent, work).await;
}
