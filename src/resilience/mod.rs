//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to destination:
//!     → registry.rs (one breaker per destination)
//!     → circuit_breaker.rs (gate: allow or fail fast)
//!     → attempt with deadline
//!     → On failure: retries.rs (retryable? sleep backoff.rs delay, try again)
//!     → circuit_breaker.rs (every attempt reports success/failure)
//! ```
//!
//! # Design Decisions
//! - Every attempt has a deadline; expiry is a typed error
//! - Retries are bounded and never cover "no responders"
//! - Circuit breaker prevents retry storms against a failing destination

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;
pub mod retries;

pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use registry::BreakerRegistry;
pub use retries::RetryPolicy;
