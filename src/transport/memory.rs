//! In-process broker.
//!
//! # Responsibilities
//! - Route published envelopes to matching subscriptions (with wildcards)
//! - Deliver each message to exactly one member per queue group
//! - Detect "no responders" for requests
//! - Store durable publishes and suppress duplicates by dedup key
//! - Simulate outages, refusals and slow connects for failure injection
//!
//! # Design Decisions
//! - Every `connect()` yields an independent link, like separate processes
//!   sharing one broker; links share the routing table, not state
//! - Subscriptions of a disconnected link stay registered but receive nothing
//!   until the link is restored

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::Envelope;
use crate::transport::subject;
use crate::transport::{
    ConnectOptions, ConnectionEvent, Connector, IncomingMessage, PublishAck, Subscription,
    Transport, TransportError,
};

const DEFAULT_SERVER: &str = "memory://local";
const DEFAULT_DEDUP_WINDOW: usize = 10_000;
const DURABLE_STREAM: &str = "memory";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State of one client link.
#[derive(Debug)]
struct Link {
    server: String,
    name: String,
    connected: AtomicBool,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Link {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

struct SubscriberEntry {
    id: u64,
    pattern: String,
    group: Option<String>,
    link: Arc<Link>,
    tx: mpsc::UnboundedSender<IncomingMessage>,
}

/// Durable storage bookkeeping with a bounded dedup window.
struct DurableStore {
    sequence: u64,
    seen: HashMap<String, u64>,
    order: VecDeque<String>,
    window: usize,
}

impl DurableStore {
    fn new(window: usize) -> Self {
        Self {
            sequence: 0,
            seen: HashMap::new(),
            order: VecDeque::new(),
            window,
        }
    }

    /// Returns `(sequence, duplicate)`.
    fn store(&mut self, dedup_key: Option<&str>) -> (u64, bool) {
        if let Some(key) = dedup_key {
            if let Some(&sequence) = self.seen.get(key) {
                return (sequence, true);
            }
        }

        self.sequence += 1;
        if let Some(key) = dedup_key {
            self.seen.insert(key.to_string(), self.sequence);
            self.order.push_back(key.to_string());
            while self.order.len() > self.window {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
        (self.sequence, false)
    }
}

struct BrokerState {
    subscriptions: Mutex<Vec<SubscriberEntry>>,
    links: Mutex<Vec<Weak<Link>>>,
    store: Mutex<DurableStore>,
    next_id: AtomicU64,
    reachable: AtomicBool,
    connect_delay_ms: AtomicU64,
}

impl BrokerState {
    /// Route one message. Returns the number of subscriptions it reached.
    fn deliver(&self, subject: &str, envelope: Envelope) -> usize {
        let mut subs = lock(&self.subscriptions);
        subs.retain(|e| !e.tx.is_closed());

        let message = IncomingMessage {
            subject: subject.to_string(),
            envelope,
        };

        let mut delivered = 0;
        let mut groups: HashMap<(&str, &str), Vec<&SubscriberEntry>> = HashMap::new();

        for entry in subs
            .iter()
            .filter(|e| e.link.is_connected() && subject::matches(&e.pattern, subject))
        {
            match &entry.group {
                None => {
                    if entry.tx.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                Some(group) => groups
                    .entry((entry.pattern.as_str(), group.as_str()))
                    .or_default()
                    .push(entry),
            }
        }

        for members in groups.values() {
            let pick = members[fastrand::usize(..members.len())];
            if pick.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }

        tracing::trace!(subject = %subject, delivered, "Routed message");
        delivered
    }

    fn live_links(&self) -> Vec<Arc<Link>> {
        let mut links = lock(&self.links);
        links.retain(|w| w.strong_count() > 0);
        links.iter().filter_map(Weak::upgrade).collect()
    }
}

/// A broker living inside the current process.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_dedup_window(DEFAULT_DEDUP_WINDOW)
    }

    /// Create a broker that remembers at most `window` dedup keys.
    pub fn with_dedup_window(window: usize) -> Self {
        Self {
            state: Arc::new(BrokerState {
                subscriptions: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
                store: Mutex::new(DurableStore::new(window.max(1))),
                next_id: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
                connect_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Refuse (false) or accept (true) new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every subsequent connection handshake.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drop every open link as if the broker went away.
    pub fn interrupt(&self) {
        for link in self.state.live_links() {
            if !link.closed.load(Ordering::SeqCst) && link.connected.swap(false, Ordering::SeqCst) {
                link.emit(ConnectionEvent::Disconnected {
                    reason: "broker interrupted".to_string(),
                });
            }
        }
    }

    /// Reconnect every interrupted link.
    pub fn restore(&self) {
        for link in self.state.live_links() {
            if !link.closed.load(Ordering::SeqCst) && !link.connected.swap(true, Ordering::SeqCst) {
                link.emit(ConnectionEvent::Reconnected {
                    server: link.server.clone(),
                });
            }
        }
    }

    /// Number of subscriptions that would receive a message on `subject`.
    pub fn subscriber_count(&self, subject_name: &str) -> usize {
        lock(&self.state.subscriptions)
            .iter()
            .filter(|e| !e.tx.is_closed() && subject::matches(&e.pattern, subject_name))
            .count()
    }

    /// Total number of live subscriptions across all links.
    pub fn subscription_count(&self) -> usize {
        lock(&self.state.subscriptions)
            .iter()
            .filter(|e| !e.tx.is_closed())
            .count()
    }

    /// Number of messages held in durable storage.
    pub fn stored_count(&self) -> u64 {
        lock(&self.state.store).sequence
    }

    /// Client names of links that are currently open.
    pub fn connected_clients(&self) -> Vec<String> {
        self.state
            .live_links()
            .iter()
            .filter(|l| l.is_connected())
            .map(|l| l.name.clone())
            .collect()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let server = options
            .servers
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(format!("{} is unreachable", server)));
        }

        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let link = Arc::new(Link {
            server: server.clone(),
            name: options.name.clone(),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            events,
        });
        lock(&self.state.links).push(Arc::downgrade(&link));
        link.emit(ConnectionEvent::Connected { server });

        Ok(Arc::new(MemoryTransport {
            broker: Arc::clone(&self.state),
            link,
        }))
    }
}

/// One client link to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: Arc<BrokerState>,
    link: Arc<Link>,
}

impl MemoryTransport {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.link.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else if !self.link.connected.load(Ordering::SeqCst) {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, subject_name: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.ensure_connected()?;
        subject::ensure_subject(subject_name)?;
        self.broker.deliver(subject_name, envelope);
        Ok(())
    }

    async fn publish_request(
        &self,
        subject_name: &str,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        subject::ensure_subject(subject_name)?;
        match self.broker.deliver(subject_name, envelope) {
            0 => Err(TransportError::NoResponders),
            _ => Ok(()),
        }
    }

    async fn publish_durable(
        &self,
        subject_name: &str,
        envelope: Envelope,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, TransportError> {
        self.ensure_connected()?;
        subject::ensure_subject(subject_name)?;
        let (sequence, duplicate) = lock(&self.broker.store).store(dedup_key);
        if !duplicate {
            self.broker.deliver(subject_name, envelope);
        }
        Ok(PublishAck {
            stream: DURABLE_STREAM.to_string(),
            sequence,
            duplicate,
        })
    }

    async fn request(
        &self,
        subject_name: &str,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        self.ensure_connected()?;
        subject::ensure_subject(subject_name)?;

        let inbox = self.new_inbox();
        let mut replies = self.subscribe(&inbox, None).await?;
        envelope.reply_to = Some(inbox);

        if self.broker.deliver(subject_name, envelope) == 0 {
            return Err(TransportError::NoResponders);
        }

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => Ok(reply.envelope),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::TimedOut),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !subject::is_valid_pattern(pattern) {
            return Err(TransportError::InvalidSubject(pattern.to_string()));
        }

        let id = self.broker.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.broker.subscriptions).push(SubscriberEntry {
            id,
            pattern: pattern.to_string(),
            group: queue_group.map(str::to_string),
            link: Arc::clone(&self.link),
            tx,
        });

        let broker = Arc::downgrade(&self.broker);
        Ok(Subscription::new(pattern, rx, move || {
            if let Some(broker) = broker.upgrade() {
                lock(&broker.subscriptions).retain(|e| e.id != id);
            }
        }))
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    async fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.link.connected.store(false, Ordering::SeqCst);
        lock(&self.broker.subscriptions).retain(|e| !Arc::ptr_eq(&e.link, &self.link));
        self.link.emit(ConnectionEvent::Closed);
        tracing::debug!(client = %self.link.name, "Memory transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(name: &str) -> ConnectOptions {
        ConnectOptions {
            servers: vec![DEFAULT_SERVER.to_string()],
            name: name.to_string(),
            headers_enabled: true,
        }
    }

    async fn link(broker: &MemoryBroker, name: &str) -> Arc<dyn Transport> {
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.connect(&options(name), tx).await.unwrap()
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let broker = MemoryBroker::new();
        let a = link(&broker, "a").await;
        let b = link(&broker, "b").await;
        let publisher = link(&broker, "p").await;

        let mut sa = a.subscribe("work", Some("g")).await.unwrap();
        let mut sb = b.subscribe("work", Some("g")).await.unwrap();

        for _ in 0..20 {
            publisher.publish("work", Envelope::new("x")).await.unwrap();
        }

        let mut total = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(10), sa.next()).await
        {
            total += 1;
        }
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(10), sb.next()).await
        {
            total += 1;
        }
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn test_request_without_subscribers() {
        let broker = MemoryBroker::new();
        let client = link(&broker, "c").await;
        let err = client
            .request("nobody.home", Envelope::new("?"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NoResponders);
        // The reply inbox must not outlive the request.
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_wildcard_is_not_a_publish_target() {
        let broker = MemoryBroker::new();
        let client = link(&broker, "c").await;
        let _sub = client.subscribe("ai.>", None).await.unwrap();

        let invalid = TransportError::InvalidSubject("ai.*".to_string());
        assert_eq!(client.publish("ai.*", Envelope::new("x")).await, Err(invalid.clone()));
        assert_eq!(client.publish_request("ai.*", Envelope::new("x")).await, Err(invalid.clone()));
        assert_eq!(
            client
                .request("ai.*", Envelope::new("x"), Duration::from_millis(10))
                .await
                .unwrap_err(),
            invalid
        );
        assert!(client.publish_durable("", Envelope::new("x"), None).await.is_err());
        assert_eq!(broker.stored_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unregisters() {
        let broker = MemoryBroker::new();
        let client = link(&broker, "c").await;
        let sub = client.subscribe("events.>", None).await.unwrap();
        assert_eq!(broker.subscriber_count("events.spawn"), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count("events.spawn"), 0);
    }

    #[tokio::test]
    async fn test_durable_dedup() {
        let broker = MemoryBroker::new();
        let client = link(&broker, "c").await;
        let first = client
            .publish_durable("events", Envelope::new("e"), Some("k1"))
            .await
            .unwrap();
        let again = client
            .publish_durable("events", Envelope::new("e"), Some("k1"))
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(first.sequence, again.sequence);
        assert_eq!(broker.stored_count(), 1);
    }

    #[test]
    fn test_dedup_window_forgets_oldest() {
        let mut store = DurableStore::new(2);
        store.store(Some("a"));
        store.store(Some("b"));
        store.store(Some("c"));
        let (_, duplicate) = store.store(Some("a"));
        assert!(!duplicate);
    }

    #[tokio::test]
    async fn test_interrupt_and_restore() {
        let broker = MemoryBroker::new();
        let (tx, mut events) = mpsc::unbounded_channel();
        let client = broker.connect(&options("c"), tx).await.unwrap();
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Connected { .. })));

        broker.interrupt();
        assert!(!client.is_connected());
        assert_eq!(
            client.publish("x", Envelope::new("")).await,
            Err(TransportError::Disconnected)
        );
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Disconnected { .. })));

        broker.restore();
        assert!(client.is_connected());
        assert!(matches!(events.recv().await, Some(ConnectionEvent::Reconnected { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = broker.connect(&options("c"), tx).await.err().unwrap();
        assert!(matches!(err, TransportError::Refused(_)));
    }
}
