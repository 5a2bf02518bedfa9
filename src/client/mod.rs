//! Client subsystem: the API callers and workers use.
//!
//! # Data Flow
//! ```text
//! Caller:
//!     request_typed / request_raw (request.rs)
//!         → encode once → breaker gate → attempts with deadline → decode
//!     publish (publish.rs)
//!         → durable (dedup key) or best-effort
//!     request_stream (stream.rs)
//!         → inbox subscription → publish → ChunkStream until final/timeout/error
//!
//! Worker:
//!     subscribe (publish.rs)          every message, handler per message
//!     serve (dispatcher.rs)           queue group, handler reply to reply_to
//!     serve_stream (stream.rs)        queue group, handler emits chunks
//! ```
//!
//! # Design Decisions
//! - `BusClient` is a cheap handle; clones share one connection
//! - Trace propagation is injected at construction (no-op by default)
//! - Handler failures and panics are isolated per message

pub mod dispatcher;
pub mod publish;
pub mod request;
pub mod stream;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Codec, Headers};
use crate::config::BusConfig;
use crate::connection::{ConnectionManager, ConnectionStats};
use crate::error::Result;
use crate::observability::{NoopPropagator, Propagator, TraceContext, TraceContextPropagator};
use crate::resilience::{BreakerRegistry, RetryPolicy};
use crate::transport::Connector;

pub use dispatcher::ServeHandle;
pub use publish::SubscriptionHandle;
pub use request::{RequestContext, RequestOptions};
pub use stream::{ChunkSender, ChunkStream, StreamChunk};

/// Error type returned by user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by user handlers.
pub type HandlerResult<T> = std::result::Result<T, BoxError>;

pub(crate) struct ClientInner {
    pub(crate) connection: ConnectionManager,
    pub(crate) codec: Codec,
    pub(crate) propagator: Arc<dyn Propagator>,
    pub(crate) retry: RetryPolicy,
    pub(crate) request_timeout: Duration,
    pub(crate) stream_timeout: Duration,
    pub(crate) durable_publish: bool,
    pub(crate) dispatch_concurrency: usize,
}

impl ClientInner {
    /// Headers every outgoing message of type `T` carries.
    pub(crate) fn outgoing_headers<T: crate::codec::Schema>(&self) -> Headers {
        let mut headers = self.codec.headers_for::<T>();
        if self.codec.headers_enabled() {
            self.propagator.inject(&mut headers);
        }
        headers
    }
}

/// Handle to a connected message-bus client.
///
/// Clones share the same connection, breakers and in-flight accounting.
#[derive(Clone)]
pub struct BusClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl BusClient {
    /// Connect with the propagator implied by `observability.trace_enabled`.
    pub async fn connect(config: &BusConfig, connector: &dyn Connector) -> Result<Self> {
        Self::builder(config.clone()).connect(connector).await
    }

    pub fn builder(config: BusConfig) -> BusClientBuilder {
        BusClientBuilder::new(config)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        self.inner.connection.breakers()
    }

    pub fn codec(&self) -> Codec {
        self.inner.codec
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.connection.stats()
    }

    /// Drain outstanding exchanges and release the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.connection.close().await
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("connection", &self.inner.connection)
            .field("codec", &self.inner.codec)
            .field("propagator", &self.inner.propagator)
            .finish()
    }
}

/// Builder for [`BusClient`].
pub struct BusClientBuilder {
    config: BusConfig,
    propagator: Option<Arc<dyn Propagator>>,
}

impl BusClientBuilder {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            propagator: None,
        }
    }

    /// Use a specific trace propagator instead of the configured default.
    pub fn propagator(mut self, propagator: Arc<dyn Propagator>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    pub async fn connect(self, connector: &dyn Connector) -> Result<BusClient> {
        let config = self.config;
        let propagator = self.propagator.unwrap_or_else(|| {
            if config.observability.trace_enabled {
                Arc::new(TraceContextPropagator)
            } else {
                Arc::new(NoopPropagator)
            }
        });

        let connection = ConnectionManager::connect(&config, connector).await?;

        Ok(BusClient {
            inner: Arc::new(ClientInner {
                connection,
                codec: Codec::new(config.payload_format, config.connection.headers_enabled),
                propagator,
                retry: RetryPolicy::from(&config.request),
                request_timeout: Duration::from_millis(config.request.timeout_ms),
                stream_timeout: Duration::from_millis(config.stream.timeout_ms),
                durable_publish: config.publish.durable_enabled,
                dispatch_concurrency: config.dispatch.concurrency.max(1),
            }),
        })
    }
}

/// Run `fut` inside a child of `parent`, or unchanged when there is none.
pub(crate) async fn within_trace<F: Future>(parent: Option<TraceContext>, fut: F) -> F::Output {
    match parent {
        Some(ctx) => ctx.child().scope(fut).await,
        None => fut.await,
    }
}

/// Render a caught panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
