//! Retry policy.
//!
//! # Responsibilities
//! - Bound the number of attempts per logical request
//! - Classify transport failures as retryable or terminal
//! - Compute the sleep between attempts
//!
//! # Design Decisions
//! - "No responders" is never retried; waiting does not create a listener
//! - Timeouts and link errors are retried up to the attempt bound
//! - Backoff sleeps hold no lock and no breaker state

use std::time::Duration;

use crate::config::RequestSettings;
use crate::resilience::backoff::calculate_backoff;
use crate::transport::TransportError;

/// Attempt bound and backoff shape for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Sleep after failed `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.backoff_min, self.backoff_max, self.jitter)
    }

    /// Whether `attempt` (1-based) is the final one.
    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts.max(1)
    }
}

impl From<&RequestSettings> for RetryPolicy {
    fn from(settings: &RequestSettings) -> Self {
        Self {
            max_attempts: settings.attempts(),
            backoff_min: Duration::from_millis(settings.backoff_min_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
            jitter: settings.jitter,
        }
    }
}

/// Whether another attempt could change the outcome of this failure.
pub fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::NoResponders => false,
        TransportError::Closed => false,
        TransportError::InvalidSubject(_) => false,
        TransportError::TimedOut
        | TransportError::Disconnected
        | TransportError::Refused(_)
        | TransportError::Other(_) => true,
    }
}
