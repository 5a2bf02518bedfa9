//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     close() called → Stop accepting → Signal background loops → Drain → Release transport
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: transport is released after the grace period either way

pub mod shutdown;

pub use shutdown::Shutdown;
