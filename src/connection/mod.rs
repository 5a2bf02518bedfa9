//! Connection subsystem.
//!
//! # Data Flow
//! ```text
//! BusConfig + Connector
//!     → manager.rs (connect within deadline, spawn event loop)
//!     → shared transport handle + breaker registry
//!
//! Every exchange:
//!     → manager.begin() (refused once draining)
//!     → tracker.rs guard held until the exchange finishes
//!
//! close():
//!     → Draining (new work refused, background loops signalled)
//!     → wait for tracker to reach zero, bounded by drain grace
//!     → transport released → Closed
//! ```
//!
//! # Design Decisions
//! - One physical link shared by every logical exchange
//! - Reconnection belongs to the transport; the manager only observes it
//! - Requests are never re-sent because of a reconnect

pub mod manager;
pub mod tracker;

pub use manager::{ConnectionManager, ConnectionState, ConnectionStats};
pub use tracker::{InFlightGuard, InFlightTracker};
