//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → tracing.rs (trace context carried in message headers)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Distributed tracing (optional, W3C traceparent)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Trace context flows through every message the client sends
//! - Metrics are cheap (atomic increments)
//! - Tracing is optional to reduce overhead when not needed

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use self::tracing::{NoopPropagator, Propagator, TraceContext, TraceContextPropagator};
