//! Circuit breaker for destination protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: destination assumed down, requests fail fast
//! - Half-Open: probing whether the destination recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold
//! Open → Half-Open: first permission check after open_timeout
//! Half-Open → Closed: success_count >= half_open_success_threshold
//! Half-Open → Open: any probe fails
//! ```
//!
//! # Design Decisions
//! - Per-destination breaker (not global)
//! - Fail fast in Open state (no network attempt)
//! - Half-Open admits at most `half_open_success_threshold` concurrent probes
//! - Each Open → Half-Open transition starts a new epoch; only admissions
//!   of the current epoch can close the breaker, reopen it or free a slot
//! - State lives behind a short, never-awaited mutex

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerSettings;
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures (while Closed) that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent Open before the next check may probe.
    pub open_timeout: Duration,
    /// Successful probes needed to close again. Also the probe concurrency limit.
    pub half_open_success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            open_timeout: Duration::from_millis(settings.open_timeout_ms),
            half_open_success_threshold: settings.half_open_success_threshold.max(1),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub destination: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub probes_in_flight: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    probes_in_flight: u32,
    half_open_epoch: u64,
}

impl Inner {
    /// Whether an outcome carried by `ticket` belongs to the current Half-Open epoch.
    fn is_current_trial(&self, ticket: Ticket) -> bool {
        match ticket {
            Ticket::Direct => true,
            Ticket::Pass => false,
            Ticket::Trial(epoch) => epoch == self.half_open_epoch,
        }
    }
}

/// How an exchange was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ticket {
    /// Outcome reported through `on_success`/`on_failure` without an admission.
    Direct,
    /// Admitted while Closed.
    Pass,
    /// Admitted while Half-Open, in the given epoch.
    Trial(u64),
}

/// Failure/success state machine guarding one destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(destination: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            destination: destination.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                probes_in_flight: 0,
                half_open_epoch: 0,
            }),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask permission for a request.
    ///
    /// May move Open to Half-Open once `open_timeout` has elapsed since the
    /// last failure. In Half-Open every admission takes a probe slot that the
    /// next `on_success`/`on_failure` gives back.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        self.try_admit_at(now).is_some()
    }

    /// Ask permission and get a guard that reports the exchange's outcome.
    ///
    /// Unlike `allow`, the guard remembers whether it holds a Half-Open slot
    /// and for which epoch, so outcomes of exchanges admitted before a trip
    /// never decide recovery.
    pub(crate) fn admit(self: &Arc<Self>) -> Option<Admission> {
        self.admit_at(Instant::now())
    }

    fn admit_at(self: &Arc<Self>, now: Instant) -> Option<Admission> {
        self.try_admit_at(now).map(|ticket| Admission {
            breaker: Arc::clone(self),
            ticket,
            reported: false,
        })
    }

    fn try_admit_at(&self, now: Instant) -> Option<Ticket> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Some(Ticket::Pass),
            BreakerState::Open => {
                let cooled = inner
                    .last_failure_time
                    .map(|t| now.saturating_duration_since(t) >= self.config.open_timeout)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_epoch += 1;
                    inner.success_count = 0;
                    inner.probes_in_flight = 1;
                    let epoch = inner.half_open_epoch;
                    drop(inner);
                    self.transitioned(BreakerState::Open, BreakerState::HalfOpen);
                    Some(Ticket::Trial(epoch))
                } else {
                    drop(inner);
                    metrics::record_breaker_rejection(&self.destination);
                    None
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_success_threshold {
                    inner.probes_in_flight += 1;
                    Some(Ticket::Trial(inner.half_open_epoch))
                } else {
                    drop(inner);
                    metrics::record_breaker_rejection(&self.destination);
                    None
                }
            }
        }
    }

    /// Report a successful exchange.
    pub fn on_success(&self) {
        self.record_success(Ticket::Direct);
    }

    fn record_success(&self, ticket: Ticket) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            // A success from before the trip says nothing about recovery.
            BreakerState::HalfOpen if !inner.is_current_trial(ticket) => {}
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                if inner.success_count >= self.config.half_open_success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.probes_in_flight = 0;
                    drop(inner);
                    self.transitioned(BreakerState::HalfOpen, BreakerState::Closed);
                }
            }
            // A late success from an exchange admitted before the trip.
            BreakerState::Open => {}
        }
    }

    /// Report a failed exchange.
    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    fn on_failure_at(&self, now: Instant) {
        self.record_failure_at(Ticket::Direct, now);
    }

    fn record_failure_at(&self, ticket: Ticket, now: Instant) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.last_failure_time = Some(now);
                    let failures = inner.failure_count;
                    drop(inner);
                    tracing::warn!(
                        destination = %self.destination,
                        failures,
                        "Circuit breaker tripped"
                    );
                    self.transitioned(BreakerState::Closed, BreakerState::Open);
                }
            }
            // Only current Half-Open admissions decide the outcome.
            BreakerState::HalfOpen if !inner.is_current_trial(ticket) => {}
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_failure_time = Some(now);
                inner.success_count = 0;
                inner.probes_in_flight = 0;
                drop(inner);
                self.transitioned(BreakerState::HalfOpen, BreakerState::Open);
            }
            // Late failures keep the destination cooling down.
            BreakerState::Open => inner.last_failure_time = Some(now),
        }
    }

    /// Give back a probe slot whose exchange never reported an outcome.
    fn release(&self, ticket: Ticket) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen
            && matches!(ticket, Ticket::Trial(_))
            && inner.is_current_trial(ticket)
        {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Current state. Unlike `allow`, never transitions.
    pub fn current_state(&self) -> BreakerState {
        self.lock().state
    }

    /// Force the breaker Closed (operator intervention).
    pub fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        inner.probes_in_flight = 0;
        drop(inner);
        tracing::info!(destination = %self.destination, "Circuit breaker reset");
        if previous != BreakerState::Closed {
            self.transitioned(previous, BreakerState::Closed);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            destination: self.destination.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            probes_in_flight: inner.probes_in_flight,
        }
    }

    fn transitioned(&self, from: BreakerState, to: BreakerState) {
        tracing::info!(
            destination = %self.destination,
            from = %from,
            to = %to,
            "Circuit breaker state change"
        );
        metrics::record_breaker_transition(&self.destination, to.as_str());
    }
}

/// Tracks one admitted exchange and reports its outcome to the breaker.
///
/// Dropping an admission that never reported gives back its probe slot, so a
/// cancelled caller cannot wedge the breaker. Admissions granted while Closed
/// hold no slot and give nothing back.
#[derive(Debug)]
pub(crate) struct Admission {
    breaker: Arc<CircuitBreaker>,
    ticket: Ticket,
    reported: bool,
}

impl Admission {
    pub(crate) fn success(&mut self) {
        self.reported = true;
        self.breaker.record_success(self.ticket);
    }

    pub(crate) fn failure(&mut self) {
        self.reported = true;
        self.breaker.record_failure_at(self.ticket, Instant::now());
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.release(self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "ai.plan",
            BreakerConfig {
                failure_threshold,
                open_timeout: Duration::from_secs(5),
                half_open_success_threshold: half_open,
            },
        )
    }

    #[test]
    fn test_trip_probe_and_recover() {
        let cb = breaker(3, 1);
        let t0 = Instant::now();

        cb.on_failure_at(t0);
        assert_eq!(cb.current_state(), BreakerState::Closed);
        cb.on_failure_at(t0);
        assert_eq!(cb.current_state(), BreakerState::Closed);
        cb.on_failure_at(t0);
        assert_eq!(cb.current_state(), BreakerState::Open);

        assert!(!cb.allow_at(t0 + Duration::from_secs(1)));
        assert_eq!(cb.current_state(), BreakerState::Open);

        assert!(cb.allow_at(t0 + Duration::from_secs(5)));
        assert_eq!(cb.current_state(), BreakerState::HalfOpen);

        cb.on_success();
        assert_eq!(cb.current_state(), BreakerState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 1);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.current_state(), BreakerState::Closed);
        cb.on_failure();
        assert_eq!(cb.current_state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_failure_reopens_and_refreshes_timer() {
        let cb = breaker(1, 2);
        let t0 = Instant::now();
        cb.on_failure_at(t0);
        let probe_at = t0 + Duration::from_secs(6);
        assert!(cb.allow_at(probe_at));
        cb.on_failure_at(probe_at);
        assert_eq!(cb.current_state(), BreakerState::Open);
        // Timer restarts from the probe failure.
        assert!(!cb.allow_at(probe_at + Duration::from_secs(4)));
        assert!(cb.allow_at(probe_at + Duration::from_secs(5)));
    }

    #[test]
    fn test_half_open_limits_probes() {
        let cb = breaker(1, 2);
        let t0 = Instant::now();
        cb.on_failure_at(t0);
        let later = t0 + Duration::from_secs(5);
        assert!(cb.allow_at(later));
        assert!(cb.allow_at(later));
        assert!(!cb.allow_at(later), "third concurrent probe must be rejected");

        cb.on_success();
        assert_eq!(cb.current_state(), BreakerState::HalfOpen);
        assert!(cb.allow_at(later), "a finished probe frees its slot");
        cb.on_success();
        assert_eq!(cb.current_state(), BreakerState::Closed);
    }

    #[test]
    fn test_abandoned_admission_releases_probe() {
        let cb = Arc::new(breaker(1, 1));
        let t0 = Instant::now();
        cb.on_failure_at(t0);
        let probe = cb.admit_at(t0 + Duration::from_secs(5)).unwrap();
        assert!(cb.admit_at(t0 + Duration::from_secs(5)).is_none());

        drop(probe);
        assert_eq!(cb.snapshot().probes_in_flight, 0);
        assert!(cb.admit_at(t0 + Duration::from_secs(5)).is_some());
    }

    #[test]
    fn test_dropping_pre_trip_admission_keeps_half_open_limit() {
        let cb = Arc::new(breaker(1, 1));
        let t0 = Instant::now();
        let before_trip = cb.admit_at(t0).unwrap();
        cb.on_failure_at(t0);
        assert_eq!(cb.current_state(), BreakerState::Open);

        let _current = cb.admit_at(t0 + Duration::from_secs(5)).unwrap();
        drop(before_trip);
        assert_eq!(cb.snapshot().probes_in_flight, 1);
        assert!(
            cb.admit_at(t0 + Duration::from_secs(5)).is_none(),
            "limit holds"
        );
    }

    #[test]
    fn test_late_outcomes_do_not_decide_half_open() {
        let cb = Arc::new(breaker(1, 1));
        let t0 = Instant::now();
        let mut slow_success = cb.admit_at(t0).unwrap();
        let mut slow_failure = cb.admit_at(t0).unwrap();
        cb.on_failure_at(t0);

        let _current = cb.admit_at(t0 + Duration::from_secs(5)).unwrap();
        slow_success.success();
        assert_eq!(cb.current_state(), BreakerState::HalfOpen);
        assert_eq!(cb.snapshot().probes_in_flight, 1);
        slow_failure.failure();
        assert_eq!(cb.current_state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_admission_from_previous_half_open_is_ignored() {
        let cb = Arc::new(breaker(1, 1));
        let t0 = Instant::now();
        cb.on_failure_at(t0);

        let mut first = cb.admit_at(t0 + Duration::from_secs(5)).unwrap();
        cb.on_failure_at(t0 + Duration::from_secs(5));
        assert_eq!(cb.current_state(), BreakerState::Open);

        let mut second = cb.admit_at(t0 + Duration::from_secs(10)).unwrap();
        first.success();
        assert_eq!(cb.current_state(), BreakerState::HalfOpen, "earlier half-open admission cannot close");
        second.success();
        assert_eq!(cb.current_state(), BreakerState::Closed);
    }

    #[test]
    fn test_reset_forces_closed() {
        let cb = breaker(1, 1);
        cb.on_failure();
        assert_eq!(cb.current_state(), BreakerState::Open);
        cb.reset();
        assert_eq!(cb.current_state(), BreakerState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_never_admits_while_cooling() {
        let cb = breaker(2, 1);
        let t0 = Instant::now();
        for step in 0..50u64 {
            let now = t0 + Duration::from_millis(step * 10);
            if cb.current_state() == BreakerState::Closed {
                cb.on_failure_at(now);
            } else {
                assert!(!cb.allow_at(now), "admitted while open at step {}", step);
            }
        }
    }
}
