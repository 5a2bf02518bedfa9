//! In-flight exchange tracking.
//!
//! # Responsibilities
//! - Count outstanding exchanges (requests, streams, publishes, handler runs)
//! - Let the drain phase of `close()` wait until the count reaches zero

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::observability::metrics;

#[derive(Debug, Default)]
struct Counter {
    active: AtomicU64,
    idle: Notify,
}

/// Tracks outstanding exchanges for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<Counter>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new exchange. Returns a guard that decrements on drop.
    pub fn track(&self) -> InFlightGuard {
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_in_flight(active);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current number of outstanding exchanges.
    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until no exchange is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard that tracks one exchange's lifetime.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Counter>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let remaining = self.inner.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_in_flight(remaining);
        if remaining == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}
