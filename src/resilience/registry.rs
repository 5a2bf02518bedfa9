//! Per-destination breaker registry.
//!
//! # Responsibilities
//! - Lazily create exactly one breaker per destination string
//! - Hand out shared breakers to concurrent callers
//! - Optionally bound growth with LRU eviction of Closed breakers
//!
//! # Design Decisions
//! - Keys are the destination exactly as given (case-sensitive)
//! - Unbounded unless `max_breakers` is configured
//! - Open and Half-Open breakers are never evicted; evicting one would
//!   silently lift the protection it provides

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::resilience::circuit_breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};

#[derive(Debug)]
struct Entry {
    breaker: Arc<CircuitBreaker>,
    last_access: AtomicU64,
}

/// Shared map of destination → breaker.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Entry>,
    max_breakers: Option<usize>,
    clock: AtomicU64,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, max_breakers: Option<usize>) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            max_breakers,
            clock: AtomicU64::new(0),
        }
    }

    /// Breaker for `destination`, created on first use.
    pub fn get_or_create(&self, destination: &str) -> Arc<CircuitBreaker> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.breakers.get(destination) {
            entry.last_access.store(tick, Ordering::Relaxed);
            return Arc::clone(&entry.breaker);
        }

        let (breaker, created) = {
            let mut created = false;
            let entry = self
                .breakers
                .entry(destination.to_string())
                .or_insert_with(|| {
                    created = true;
                    Entry {
                        breaker: Arc::new(CircuitBreaker::new(destination, self.config)),
                        last_access: AtomicU64::new(tick),
                    }
                });
            entry.last_access.store(tick, Ordering::Relaxed);
            (Arc::clone(&entry.breaker), created)
        };

        if created {
            tracing::debug!(destination = %destination, "Created circuit breaker");
            self.evict_if_needed(destination);
        }
        breaker
    }

    /// Existing breaker for `destination`, if any.
    pub fn get(&self, destination: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(destination).map(|e| Arc::clone(&e.breaker))
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Force one destination's breaker Closed. Returns false if unknown.
    pub fn reset(&self, destination: &str) -> bool {
        match self.get(destination) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Force every breaker Closed.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| Arc::clone(&e.breaker)).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Snapshot of every breaker, sorted by destination.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|e| e.breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.destination.cmp(&b.destination));
        snapshots
    }

    /// Destinations whose breaker is not Closed.
    pub fn tripped(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.state != BreakerState::Closed)
            .map(|s| s.destination)
            .collect()
    }

    fn evict_if_needed(&self, keep: &str) {
        let Some(max) = self.max_breakers else {
            return;
        };

        while self.breakers.len() > max {
            let victim = self
                .breakers
                .iter()
                .filter(|e| e.key() != keep && e.breaker.current_state() == BreakerState::Closed)
                .min_by_key(|e| e.last_access.load(Ordering::Relaxed))
                .map(|e| (e.key().clone(), e.last_access.load(Ordering::Relaxed)));

            let Some((destination, seen)) = victim else {
                tracing::debug!(
                    breakers = self.breakers.len(),
                    max,
                    "Breaker registry over capacity with nothing evictable"
                );
                return;
            };

            let removed = self.breakers.remove_if(&destination, |_, e| {
                e.last_access.load(Ordering::Relaxed) == seen
                    && e.breaker.current_state() == BreakerState::Closed
            });
            if removed.is_some() {
                tracing::debug!(destination = %destination, "Evicted idle circuit breaker");
            }
        }
    }
}
