//! NATS transport.
//!
//! # Responsibilities
//! - Map the transport contract onto a NATS client connection
//! - Durable publishes go through JetStream with `Nats-Msg-Id` deduplication
//! - Translate client reconnect notifications into [`ConnectionEvent`]s
//!
//! # Design Decisions
//! - Reconnection is left to the NATS client; publishes made while it
//!   reconnects are buffered by the client, not rejected
//! - Each subscription is pumped into a channel by its own task; dropping the
//!   [`Subscription`] aborts the task, which unsubscribes from the server
//! - A plain publish cannot detect an empty subject. A "no responders" status
//!   delivered to a stream inbox is surfaced as a `stream-error` chunk

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::client::RequestErrorKind;
use async_nats::{Event, HeaderMap, ServerAddr, StatusCode};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::codec::headers::STREAM_ERROR;
use crate::codec::{Envelope, Headers};
use crate::transport::subject;
use crate::transport::{
    ConnectOptions, ConnectionEvent, Connector, IncomingMessage, PublishAck, Subscription,
    Transport, TransportError,
};

const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";
const MSG_ID_HEADER: &str = "Nats-Msg-Id";

fn other(error: impl std::fmt::Display) -> TransportError {
    TransportError::Other(error.to_string())
}

/// Copy envelope headers into a NATS header map.
fn to_nats_headers(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        map.insert(name, value);
    }
    map
}

/// Copy NATS headers into envelope headers. Repeated values keep the last one.
fn from_nats_headers(map: Option<&HeaderMap>) -> Headers {
    let mut headers = Headers::new();
    if let Some(map) = map {
        for (name, values) in map.iter() {
            if let Some(value) = values.last() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
    }
    headers
}

fn to_incoming(message: async_nats::Message) -> IncomingMessage {
    let mut headers = from_nats_headers(message.headers.as_ref());
    if message.status == Some(StatusCode::NO_RESPONDERS) {
        headers.insert(STREAM_ERROR, "no responders");
    }
    IncomingMessage {
        subject: message.subject.to_string(),
        envelope: Envelope {
            payload: message.payload,
            headers,
            reply_to: message.reply.map(|reply| reply.to_string()),
        },
    }
}

fn parse_servers(servers: &[String]) -> Result<Vec<ServerAddr>, TransportError> {
    if servers.is_empty() {
        return DEFAULT_SERVER
            .parse::<ServerAddr>()
            .map(|addr| vec![addr])
            .map_err(other);
    }
    servers
        .iter()
        .map(|server| {
            server
                .parse::<ServerAddr>()
                .map_err(|e| TransportError::Refused(format!("invalid server '{}': {}", server, e)))
        })
        .collect()
}

/// Connects to a NATS server (or cluster).
#[derive(Debug, Clone, Default)]
pub struct NatsConnector {
    /// Upper bound on each TCP connect attempt made by the client.
    pub connection_timeout: Option<Duration>,
}

impl NatsConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let servers = parse_servers(&options.servers)?;
        let server = options
            .servers
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        let online = Arc::new(AtomicBool::new(false));
        let lost = Arc::new(AtomicBool::new(false));
        let link = Arc::clone(&online);
        let notify = events.clone();
        let event_server = server.clone();
        let mut nats_options = async_nats::ConnectOptions::new()
            .name(&options.name)
            .request_timeout(None)
            .event_callback(move |event| {
                let notify = notify.clone();
                let online = Arc::clone(&link);
                let lost = Arc::clone(&lost);
                let server = event_server.clone();
                async move {
                    let translated = match event {
                        Event::Disconnected => {
                            online.store(false, Ordering::SeqCst);
                            lost.store(true, Ordering::SeqCst);
                            Some(ConnectionEvent::Disconnected {
                                reason: "connection to server lost".to_string(),
                            })
                        }
                        Event::Connected => {
                            online.store(true, Ordering::SeqCst);
                            lost.swap(false, Ordering::SeqCst)
                                .then_some(ConnectionEvent::Reconnected { server })
                        }
                        unhandled => {
                            tracing::debug!(event = ?unhandled, "NATS client event");
                            None
                        }
                    };
                    if let Some(event) = translated {
                        let _ = notify.send(event);
                    }
                }
            });
        if let Some(timeout) = self.connection_timeout {
            nats_options = nats_options.connection_timeout(timeout);
        }

        let client = nats_options
            .connect(servers.as_slice())
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))?;
        online.store(true, Ordering::SeqCst);

        let _ = events.send(ConnectionEvent::Connected {
            server: server.clone(),
        });
        tracing::debug!(client = %options.name, server = %server, "NATS transport connected");

        Ok(Arc::new(NatsTransport {
            jetstream: async_nats::jetstream::new(client.clone()),
            client,
            name: options.name.clone(),
            online,
            closed: AtomicBool::new(false),
            events,
        }))
    }
}

/// One client link to a NATS server.
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: async_nats::jetstream::Context,
    name: String,
    online: Arc<AtomicBool>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl NatsTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, subject_name: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.ensure_open()?;
        subject::ensure_subject(subject_name)?;
        let headers = to_nats_headers(&envelope.headers);
        let subject_name = subject_name.to_string();
        match envelope.reply_to {
            Some(reply) => self
                .client
                .publish_with_reply_and_headers(subject_name, reply, headers, envelope.payload)
                .await
                .map_err(other),
            None => self
                .client
                .publish_with_headers(subject_name, headers, envelope.payload)
                .await
                .map_err(other),
        }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject_name: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.send(subject_name, envelope).await
    }

    async fn publish_request(
        &self,
        subject_name: &str,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.send(subject_name, envelope).await
    }

    async fn publish_durable(
        &self,
        subject_name: &str,
        envelope: Envelope,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, TransportError> {
        self.ensure_open()?;
        subject::ensure_subject(subject_name)?;
        let mut headers = to_nats_headers(&envelope.headers);
        if let Some(key) = dedup_key {
            headers.insert(MSG_ID_HEADER, key);
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject_name.to_string(), headers, envelope.payload)
            .await
            .map_err(other)?
            .await
            .map_err(other)?;
        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn request(
        &self,
        subject_name: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        self.ensure_open()?;
        subject::ensure_subject(subject_name)?;

        let pending = self.client.request_with_headers(
            subject_name.to_string(),
            to_nats_headers(&envelope.headers),
            envelope.payload,
        );
        match tokio::time::timeout(timeout, pending).await {
            Ok(Ok(reply)) => Ok(to_incoming(reply).envelope),
            Ok(Err(e)) => Err(match e.kind() {
                RequestErrorKind::NoResponders => TransportError::NoResponders,
                RequestErrorKind::TimedOut => TransportError::TimedOut,
                _ => other(e),
            }),
            Err(_) => Err(TransportError::TimedOut),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        if !subject::is_valid_pattern(pattern) {
            return Err(TransportError::InvalidSubject(pattern.to_string()));
        }

        let mut subscriber = match queue_group {
            Some(group) => self
                .client
                .queue_subscribe(pattern.to_string(), group.to_string())
                .await
                .map_err(other)?,
            None => self
                .client
                .subscribe(pattern.to_string())
                .await
                .map_err(other)?,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if tx.send(to_incoming(message)).is_err() {
                    break;
                }
            }
        });
        let abort = pump.abort_handle();
        Ok(Subscription::new(pattern, rx, move || abort.abort()))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.online.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.flush().await {
            tracing::warn!(client = %self.name, error = %e, "Failed to flush NATS client on close");
        }
        self.online.store(false, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Closed);
        tracing::debug!(client = %self.name, "NATS transport closed");
    }
}
