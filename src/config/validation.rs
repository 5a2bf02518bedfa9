//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds >= 1)
//! - Check broker endpoints parse as URLs with a host
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BusConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;
use url::Url;

use crate::config::schema::BusConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("connection.servers must list at least one endpoint")]
    NoServers,

    #[error("invalid server endpoint '{endpoint}': {reason}")]
    InvalidServer { endpoint: String, reason: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("request.backoff_min_ms ({min}) exceeds request.backoff_max_ms ({max})")]
    BackoffRange { min: u64, max: u64 },

    #[error("invalid log level '{0}'")]
    LogLevel(String),

    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),
}

/// Parse a broker endpoint. Bare `host:port` is accepted and read as `nats://host:port`.
pub fn parse_server(endpoint: &str) -> Result<Url, ValidationError> {
    let candidate = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("nats://{}", endpoint)
    };

    let url = Url::parse(&candidate).map_err(|e| ValidationError::InvalidServer {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::InvalidServer {
            endpoint: endpoint.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &BusConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.connection.servers.is_empty() {
        errors.push(ValidationError::NoServers);
    }
    for endpoint in &config.connection.servers {
        if let Err(e) = parse_server(endpoint) {
            errors.push(e);
        }
    }

    // An explicit retry count supersedes max_attempts.
    let max_attempts = match config.request.request_retries {
        Some(_) => 1,
        None => config.request.max_attempts,
    };
    let positive = [
        ("connection.connect_timeout_ms", config.connection.connect_timeout_ms),
        ("request.timeout_ms", config.request.timeout_ms),
        ("request.max_attempts", u64::from(max_attempts)),
        ("breaker.failure_threshold", u64::from(config.breaker.failure_threshold)),
        (
            "breaker.half_open_success_threshold",
            u64::from(config.breaker.half_open_success_threshold),
        ),
        ("stream.timeout_ms", config.stream.timeout_ms),
        ("dispatch.concurrency", config.dispatch.concurrency as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }
    if config.breaker.max_breakers == Some(0) {
        errors.push(ValidationError::Zero { field: "breaker.max_breakers" });
    }

    if config.request.backoff_min_ms > config.request.backoff_max_ms {
        errors.push(ValidationError::BackoffRange {
            min: config.request.backoff_min_ms,
            max: config.request.backoff_max_ms,
        });
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        errors.push(ValidationError::LogLevel(config.observability.log_level.clone()));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<std::net::SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
