//! Chunked streaming responses.
//!
//! # Data Flow
//! ```text
//! Consumer (request_stream):
//!     encode → breaker gate → new inbox → subscribe(inbox) → publish(reply_to = inbox)
//!     → ChunkStream::next() until final chunk / end marker / error chunk / deadline
//!
//! Responder (serve_stream):
//!     queue group → decode request → handler(request, ChunkSender)
//!     → ChunkSender::send / send_final / end / fail → publish to reply_to
//! ```
//!
//! # Wire Format
//! Every chunk is an envelope on the consumer's inbox:
//! - `stream-seq`: chunk index, starting at 0
//! - `stream-final`: `"true"` on the last payload chunk
//! - `stream-end`: end of stream without a payload
//! - `stream-error`: responder failure; the value is the reason
//!
//! # Design Decisions
//! - The deadline covers the whole stream, measured from the request send
//! - Nothing is yielded after the first terminal chunk
//! - The inbox subscription is owned by the stream and released on every
//!   exit path, including when the consumer drops the stream early
//! - A stream reports exactly one outcome to the destination's breaker

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, Stream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::client::dispatcher::{spawn_worker_loop, ServeHandle};
use crate::client::{panic_message, within_trace, BusClient, ClientInner, HandlerResult};
use crate::codec::headers::{STREAM_END, STREAM_ERROR, STREAM_FINAL, STREAM_SEQ};
use crate::codec::{Codec, Envelope, Headers, Schema};
use crate::connection::InFlightGuard;
use crate::error::{BusError, Result};
use crate::observability::{metrics, Propagator};
use crate::resilience::circuit_breaker::Admission;
use crate::transport::{IncomingMessage, Subscription, Transport, TransportError};

/// One element of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk<T> {
    pub payload: T,
    pub is_final: bool,
}

/// Lazy, finite, non-restartable sequence of reply chunks.
pub struct ChunkStream<T> {
    destination: String,
    codec: Codec,
    subscription: Option<Subscription>,
    admission: Option<Admission>,
    in_flight: Option<InFlightGuard>,
    deadline: Instant,
    timeout: Duration,
    received: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + Schema> ChunkStream<T> {
    /// Next chunk, or `None` once the stream has ended.
    ///
    /// Fails with [`BusError::ServiceTimeout`] when the whole-stream deadline
    /// passes and with [`BusError::Stream`] when the responder reports an error.
    /// Either failure ends the stream.
    pub async fn next(&mut self) -> Option<Result<StreamChunk<T>>> {
        let subscription = self.subscription.as_mut()?;

        let message = match tokio::time::timeout_at(self.deadline, subscription.next()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.finish(false);
                return Some(Err(BusError::Stream {
                    destination: self.destination.clone(),
                    reason: "reply subscription closed".to_string(),
                }));
            }
            Err(_) => {
                tracing::warn!(
                    destination = %self.destination,
                    received = self.received,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Stream timed out"
                );
                self.finish(false);
                return Some(Err(BusError::ServiceTimeout {
                    destination: self.destination.clone(),
                    attempts: 1,
                    timeout_ms: self.timeout.as_millis() as u64,
                }));
            }
        };

        let headers = &message.envelope.headers;
        if let Some(reason) = headers.get(STREAM_ERROR) {
            let reason = reason.to_string();
            tracing::warn!(destination = %self.destination, reason = %reason, "Stream failed");
            self.finish(false);
            return Some(Err(BusError::Stream {
                destination: self.destination.clone(),
                reason,
            }));
        }
        if headers.contains(STREAM_END) {
            self.finish(true);
            return None;
        }

        let is_final = headers.get(STREAM_FINAL) == Some("true");
        match self.codec.decode_envelope::<T>(&message.envelope) {
            Ok(payload) => {
                self.received += 1;
                metrics::record_stream_chunk(&self.destination);
                if is_final {
                    self.finish(true);
                }
                Some(Ok(StreamChunk { payload, is_final }))
            }
            Err(e) => {
                self.finish(false);
                Some(Err(e))
            }
        }
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk?.payload);
        }
        Ok(chunks)
    }

    /// Adapt to a [`futures_util::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamChunk<T>>> {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}

impl<T> ChunkStream<T> {
    /// Whether the stream has ended.
    pub fn is_finished(&self) -> bool {
        self.subscription.is_none()
    }

    /// Chunks yielded so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Release the inbox and report the outcome. Runs once.
    fn finish(&mut self, success: bool) {
        self.subscription = None;
        if let Some(mut admission) = self.admission.take() {
            if success {
                admission.success();
            } else {
                admission.failure();
            }
        }
        self.in_flight = None;
    }
}

impl<T> std::fmt::Debug for ChunkStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("destination", &self.destination)
            .field("received", &self.received)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl BusClient {
    /// Send a request whose response arrives as a sequence of chunks.
    pub async fn request_stream<Req, Chunk>(
        &self,
        destination: &str,
        request: &Req,
    ) -> Result<ChunkStream<Chunk>>
    where
        Req: Serialize + Schema,
        Chunk: DeserializeOwned + Schema,
    {
        self.request_stream_with(destination, request, self.inner.stream_timeout)
            .await
    }

    /// As [`BusClient::request_stream`] with an explicit whole-stream deadline.
    pub async fn request_stream_with<Req, Chunk>(
        &self,
        destination: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<ChunkStream<Chunk>>
    where
        Req: Serialize + Schema,
        Chunk: DeserializeOwned + Schema,
    {
        let payload = self.inner.codec.encode(request)?;
        let headers = self.inner.outgoing_headers::<Req>();
        let in_flight = self.inner.connection.begin()?;

        let breaker = self.inner.connection.get_or_create_breaker(destination);
        let Some(mut admission) = breaker.admit() else {
            return Err(BusError::CircuitOpen {
                destination: destination.to_string(),
            });
        };

        let transport = self.inner.connection.transport();
        let inbox = transport.new_inbox();
        let subscription = match transport.subscribe(&inbox, None).await {
            Ok(subscription) => subscription,
            Err(TransportError::Closed) => return Err(BusError::Closed),
            Err(source) => {
                admission.failure();
                return Err(BusError::Subscribe {
                    destination: destination.to_string(),
                    source,
                });
            }
        };

        let deadline = Instant::now() + timeout;
        let envelope = Envelope::new(payload)
            .with_headers(headers)
            .with_reply_to(inbox);

        match transport.publish_request(destination, envelope).await {
            Ok(()) => {}
            Err(TransportError::NoResponders) => {
                admission.failure();
                tracing::warn!(destination = %destination, "No responders for stream request");
                return Err(BusError::ServiceUnavailable {
                    destination: destination.to_string(),
                });
            }
            Err(TransportError::Closed) => return Err(BusError::Closed),
            Err(source @ TransportError::InvalidSubject(_)) => {
                return Err(BusError::Publish {
                    destination: destination.to_string(),
                    source,
                });
            }
            Err(source) => {
                admission.failure();
                return Err(BusError::Publish {
                    destination: destination.to_string(),
                    source,
                });
            }
        }

        tracing::debug!(destination = %destination, "Stream request sent");
        Ok(ChunkStream {
            destination: destination.to_string(),
            codec: self.inner.codec,
            subscription: Some(subscription),
            admission: Some(admission),
            in_flight: Some(in_flight),
            deadline,
            timeout,
            received: 0,
            _marker: PhantomData,
        })
    }

    /// Serve a streaming destination as a member of `group`.
    ///
    /// The stream is closed with an end marker when `handler` returns without
    /// sending a final chunk, and with an error chunk when it fails or panics.
    pub async fn serve_stream<Req, F, Fut>(
        &self,
        destination: &str,
        group: &str,
        handler: F,
    ) -> Result<ServeHandle>
    where
        Req: DeserializeOwned + Schema + Send + 'static,
        F: Fn(Req, ChunkSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        let subscription = self.join_group(destination, group).await?;
        let handler = Arc::new(handler);

        let task = spawn_worker_loop(
            Arc::clone(&self.inner),
            subscription,
            move |inner, message, in_flight| {
                let handler = Arc::clone(&handler);
                async move {
                    stream_to_requester::<Req, F, Fut>(&inner, handler.as_ref(), message, in_flight)
                        .await
                }
            },
        );

        tracing::info!(destination = %destination, group = %group, "Serving streams");
        Ok(ServeHandle::new(destination.to_string(), group.to_string(), task))
    }
}

async fn stream_to_requester<Req, F, Fut>(
    inner: &ClientInner,
    handler: &F,
    message: IncomingMessage,
    _in_flight: InFlightGuard,
) where
    Req: DeserializeOwned + Schema,
    F: Fn(Req, ChunkSender) -> Fut,
    Fut: Future<Output = HandlerResult<()>>,
{
    let IncomingMessage { subject, envelope } = message;

    let Some(reply_to) = envelope.reply_to.clone() else {
        tracing::warn!(subject = %subject, "Dropping stream request without reply address");
        metrics::record_handler_error(&subject, "no_reply_to");
        return;
    };

    let sender = ChunkSender::new(
        Arc::clone(inner.connection.transport()),
        inner.codec,
        Arc::clone(&inner.propagator),
        reply_to,
    );

    let request = match inner.codec.decode_envelope::<Req>(&envelope) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(subject = %subject, error = %e, "Dropping undecodable stream request");
            metrics::record_handler_error(&subject, "decode");
            if let Err(send_error) = sender.fail(&e.to_string()).await {
                tracing::warn!(
                    subject = %subject,
                    error = %send_error,
                    "Failed to report undecodable stream request"
                );
            }
            return;
        }
    };

    let parent = inner.propagator.extract(&envelope.headers);
    let work = async move {
        let call = {
            let sender = sender.clone();
            async move { handler(request, sender).await }
        };
        let outcome = AssertUnwindSafe(call).catch_unwind().await;

        let closed = match outcome {
            Ok(Ok(())) if sender.is_finished() => Ok(()),
            Ok(Ok(())) => sender.end().await,
            Ok(Err(e)) => {
                tracing::error!(subject = %subject, error = %e, "Stream handler failed");
                metrics::record_handler_error(&subject, "error");
                sender.fail(&e.to_string()).await
            }
            Err(panic) => {
                tracing::error!(
                    subject = %subject,
                    panic = %panic_message(panic.as_ref()),
                    "Stream handler panicked"
                );
                metrics::record_handler_error(&subject, "panic");
                sender.fail("handler panicked").await
            }
        };
        match closed {
            Ok(()) => {}
            // The handler already terminated the stream itself.
            Err(BusError::Stream { .. }) => {}
            Err(e) => tracing::warn!(subject = %subject, error = %e, "Failed to terminate stream"),
        }
    };

    within_trace(parent, work).await;
}

struct SenderState {
    transport: Arc<dyn Transport>,
    codec: Codec,
    propagator: Arc<dyn Propagator>,
    reply_to: String,
    sequence: AtomicU64,
    finished: AtomicBool,
}

/// Responder-side handle for emitting the chunks of one stream.
///
/// Clones share the stream; once any clone sends a terminal chunk every
/// further send fails.
#[derive(Clone)]
pub struct ChunkSender {
    state: Arc<SenderState>,
}

impl ChunkSender {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        codec: Codec,
        propagator: Arc<dyn Propagator>,
        reply_to: String,
    ) -> Self {
        Self {
            state: Arc::new(SenderState {
                transport,
                codec,
                propagator,
                reply_to,
                sequence: AtomicU64::new(0),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Address the chunks are delivered to.
    pub fn reply_to(&self) -> &str {
        &self.state.reply_to
    }

    /// Whether a terminal chunk was already sent.
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    /// Send a non-final chunk.
    pub async fn send<T: Serialize + Schema>(&self, chunk: &T) -> Result<()> {
        self.send_chunk(chunk, false).await
    }

    /// Send the last chunk of the stream.
    pub async fn send_final<T: Serialize + Schema>(&self, chunk: &T) -> Result<()> {
        self.send_chunk(chunk, true).await
    }

    /// End the stream without a payload.
    pub async fn end(&self) -> Result<()> {
        self.claim_terminal()?;
        let mut headers = self.base_headers();
        headers.insert(STREAM_END, "true");
        self.emit(Envelope::new(bytes::Bytes::new()).with_headers(headers))
            .await
    }

    /// Terminate the stream with an error the consumer will observe.
    pub async fn fail(&self, reason: &str) -> Result<()> {
        self.claim_terminal()?;
        let mut headers = self.base_headers();
        headers.insert(STREAM_ERROR, reason);
        self.emit(Envelope::new(bytes::Bytes::new()).with_headers(headers))
            .await
    }

    async fn send_chunk<T: Serialize + Schema>(&self, chunk: &T, is_final: bool) -> Result<()> {
        if is_final {
            self.claim_terminal()?;
        } else if self.is_finished() {
            return Err(self.already_finished());
        }

        let payload = self.state.codec.encode(chunk)?;
        let mut headers = self.base_headers();
        headers.extend(&self.state.codec.headers_for::<T>());
        headers.insert(STREAM_FINAL, if is_final { "true" } else { "false" });
        self.emit(Envelope::new(payload).with_headers(headers)).await
    }

    fn claim_terminal(&self) -> Result<()> {
        if self.state.finished.swap(true, Ordering::SeqCst) {
            return Err(self.already_finished());
        }
        Ok(())
    }

    fn already_finished(&self) -> BusError {
        BusError::Stream {
            destination: self.state.reply_to.clone(),
            reason: "stream already finished".to_string(),
        }
    }

    fn base_headers(&self) -> Headers {
        let mut headers = Headers::new();
        let sequence = self.state.sequence.fetch_add(1, Ordering::SeqCst);
        headers.insert(STREAM_SEQ, sequence.to_string());
        if self.state.codec.headers_enabled() {
            self.state.propagator.inject(&mut headers);
        }
        headers
    }

    async fn emit(&self, envelope: Envelope) -> Result<()> {
        self.state
            .transport
            .publish(&self.state.reply_to, envelope)
            .await
            .map_err(|source| BusError::Publish {
                destination: self.state.reply_to.clone(),
                source,
            })
    }
}

impl std::fmt::Debug for ChunkSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSender")
            .field("reply_to", &self.state.reply_to)
            .field("finished", &self.is_finished())
            .finish()
    }
}
