//! Connection lifecycle and shared resources.
//!
//! # Responsibilities
//! - Establish the broker link within `connect_timeout`
//! - Log and count link events (disconnected / reconnected / closed)
//! - Own the breaker registry and the in-flight tracker
//! - Drain and release the link on `close()`

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BusConfig;
use crate::connection::tracker::{InFlightGuard, InFlightTracker};
use crate::error::{BusError, Result};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resilience::{BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitBreaker};
use crate::transport::{ConnectOptions, ConnectionEvent, Connector, Transport};

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Link is up and accepting work.
    Connected,
    /// Link dropped; the transport is re-establishing it. Work is still accepted.
    Reconnecting,
    /// `close()` is waiting for outstanding exchanges.
    Draining,
    /// Link released.
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Reconnecting,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connected => 0,
            Self::Reconnecting => 1,
            Self::Draining => 2,
            Self::Closed => 3,
        }
    }
}

/// Health snapshot for a health-check reporter.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub name: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub in_flight: u64,
    pub breakers: Vec<BreakerSnapshot>,
}

/// Owns the broker link and everything shared by concurrent exchanges on it.
pub struct ConnectionManager {
    name: String,
    transport: Arc<dyn Transport>,
    breakers: BreakerRegistry,
    tracker: InFlightTracker,
    shutdown: Shutdown,
    state: Arc<AtomicU8>,
    closing: AtomicBool,
    drain_grace: Duration,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Connect to the broker. Fails fast with [`BusError::Connection`] on
    /// refusal or when `connect_timeout_ms` elapses.
    pub async fn connect(config: &BusConfig, connector: &dyn Connector) -> Result<Self> {
        let options = ConnectOptions {
            servers: config.connection.servers.clone(),
            name: config.connection.name.clone(),
            headers_enabled: config.connection.headers_enabled,
        };
        let connect_timeout = Duration::from_millis(config.connection.connect_timeout_ms);

        tracing::info!(
            name = %options.name,
            servers = ?options.servers,
            timeout_ms = config.connection.connect_timeout_ms,
            "Connecting to message bus"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport =
            match tokio::time::timeout(connect_timeout, connector.connect(&options, events_tx)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    tracing::error!(name = %options.name, error = %e, "Connection failed");
                    return Err(BusError::Connection {
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    tracing::error!(
                        name = %options.name,
                        timeout_ms = config.connection.connect_timeout_ms,
                        "Connection timed out"
                    );
                    return Err(BusError::Connection {
                        reason: format!(
                            "timed out after {}ms",
                            config.connection.connect_timeout_ms
                        ),
                    });
                }
            };

        let state = Arc::new(AtomicU8::new(ConnectionState::Connected.as_u8()));
        let shutdown = Shutdown::new();
        let event_task = tokio::spawn(run_event_loop(
            options.name.clone(),
            events_rx,
            Arc::clone(&state),
            shutdown.clone(),
        ));
        metrics::record_connected(true);

        Ok(Self {
            name: options.name,
            transport,
            breakers: BreakerRegistry::new(
                BreakerConfig::from(&config.breaker),
                config.breaker.max_breakers,
            ),
            tracker: InFlightTracker::new(),
            shutdown,
            state,
            closing: AtomicBool::new(false),
            drain_grace: Duration::from_millis(config.connection.drain_grace_ms),
            event_task: Mutex::new(Some(event_task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Breaker for `destination`, created on first use.
    pub fn get_or_create_breaker(&self, destination: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(destination)
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.transport.is_connected()
    }

    pub fn in_flight(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Shutdown signal observed by background loops.
    pub(crate) fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Register a new exchange. Fails with [`BusError::Closed`] once draining.
    pub(crate) fn begin(&self) -> Result<InFlightGuard> {
        // Track before checking so a concurrent drain either sees this
        // exchange or this exchange sees the drain.
        let guard = self.tracker.track();
        if self.closing.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(guard)
    }

    /// Stop accepting work, wait up to the drain grace period for outstanding
    /// exchanges, then release the link.
    ///
    /// Safe to call more than once; later calls return `Ok(())` immediately.
    /// The link is released even when the grace period expires, in which case
    /// [`BusError::DrainTimeout`] reports how many exchanges were abandoned.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state
            .store(ConnectionState::Draining.as_u8(), Ordering::SeqCst);
        tracing::info!(
            name = %self.name,
            in_flight = self.tracker.active_count(),
            grace_ms = self.drain_grace.as_millis() as u64,
            "Draining connection"
        );
        self.shutdown.trigger();

        let drained = tokio::time::timeout(self.drain_grace, self.tracker.wait_idle())
            .await
            .is_ok();
        let outstanding = self.tracker.active_count();

        self.transport.close().await;
        self.state.store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        metrics::record_connected(false);

        let event_task = self
            .event_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = event_task {
            handle.abort();
        }

        if drained {
            tracing::info!(name = %self.name, "Connection closed");
            Ok(())
        } else {
            tracing::warn!(
                name = %self.name,
                outstanding,
                "Drain grace period expired; closing with exchanges outstanding"
            );
            Err(BusError::DrainTimeout { outstanding })
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            name: self.name.clone(),
            state: self.state(),
            connected: self.is_connected(),
            in_flight: self.tracker.active_count(),
            breakers: self.breakers.snapshot(),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("in_flight", &self.tracker.active_count())
            .finish()
    }
}

/// Move between Connected and Reconnecting unless the manager is shutting down.
fn set_link_state(state: &AtomicU8, from: ConnectionState, to: ConnectionState) {
    let _ = state.compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst);
}

/// Logs link events until shutdown. Reconnection itself is the transport's job.
async fn run_event_loop(
    name: String,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    state: Arc<AtomicU8>,
    shutdown: Shutdown,
) {
    let stopped = shutdown.wait();
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnectionEvent::Connected { server } => {
                        tracing::info!(name = %name, server = %server, "Connected to message bus");
                        metrics::record_connection_event("connected");
                    }
                    ConnectionEvent::Disconnected { reason } => {
                        tracing::warn!(name = %name, reason = %reason, "Connection lost, reconnecting");
                        set_link_state(&state, ConnectionState::Connected, ConnectionState::Reconnecting);
                        metrics::record_connection_event("disconnected");
                        metrics::record_connected(false);
                    }
                    ConnectionEvent::Reconnected { server } => {
                        tracing::info!(name = %name, server = %server, "Reconnected to message bus");
                        set_link_state(&state, ConnectionState::Reconnecting, ConnectionState::Connected);
                        metrics::record_connection_event("reconnected");
                        metrics::record_connected(true);
                    }
                    ConnectionEvent::Closed => {
                        tracing::debug!(name = %name, "Transport reported closed");
                        metrics::record_connection_event("closed");
                        break;
                    }
                }
            }
        }
    }
}
