//! Payload codec subsystem.
//!
//! # Data Flow
//! ```text
//! Outgoing:
//!     typed value (Serialize + Schema)
//!     → format.rs (JSON or bincode bytes, deterministic)
//!     → payload.rs (content-type + message-type headers)
//!     → Envelope handed to the transport
//!
//! Incoming:
//!     Envelope from the transport
//!     → payload.rs (validate message-type against the target schema)
//!     → format.rs (decode using the sender's content-type)
//!     → typed value
//! ```
//!
//! # Design Decisions
//! - Encoding is deterministic so retries are byte-identical
//! - Receivers validate schema identity before decoding
//! - Absent optional fields fall back to serde defaults (JSON format)

pub mod envelope;
pub mod format;
pub mod headers;
pub mod payload;

pub use envelope::Envelope;
pub use format::PayloadFormat;
pub use headers::Headers;
pub use payload::{Codec, Schema};
