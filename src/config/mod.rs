//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BusConfig (validated, immutable)
//!     → handed to BusClient::connect
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a new client
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{from_toml_str, load_config, ConfigError};
pub use schema::{
    BreakerSettings, BusConfig, ConnectionSettings, DispatchSettings, LogFormat,
    ObservabilityConfig, PublishSettings, RequestSettings, StreamSettings,
};
pub use validation::{validate_config, ValidationError};
