//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a bus client.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::codec::PayloadFormat;

/// Root configuration for a bus client.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BusConfig {
    /// Broker endpoints and link lifecycle.
    pub connection: ConnectionSettings,

    /// Request/reply deadlines and retry policy.
    pub request: RequestSettings,

    /// Per-destination circuit breaker thresholds.
    pub breaker: BreakerSettings,

    /// Publish behaviour.
    pub publish: PublishSettings,

    /// Streaming request settings.
    pub stream: StreamSettings,

    /// Worker-side dispatch settings.
    pub dispatch: DispatchSettings,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Payload serialization format for outgoing messages.
    pub payload_format: PayloadFormat,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Broker endpoints (e.g., "nats://127.0.0.1:4222").
    pub servers: Vec<String>,

    /// Client identity reported to the broker.
    pub name: String,

    /// Deadline for the initial connection.
    pub connect_timeout_ms: u64,

    /// How long `close()` waits for outstanding exchanges.
    pub drain_grace_ms: u64,

    /// Attach content-type, schema and trace headers to messages.
    pub headers_enabled: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            name: "bus-client".to_string(),
            connect_timeout_ms: 5_000,
            drain_grace_ms: 5_000,
            headers_enabled: true,
        }
    }
}

/// Request/reply configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Per-attempt reply deadline.
    pub timeout_ms: u64,

    /// Total attempts per logical request (1 = no retry).
    pub max_attempts: u32,

    /// Retries after the first attempt. When set, overrides `max_attempts`
    /// with `request_retries + 1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_retries: Option<u32>,

    /// First backoff delay.
    pub backoff_min_ms: u64,

    /// Backoff ceiling.
    pub backoff_max_ms: u64,

    /// Add up to 10% random jitter to each backoff.
    pub jitter: bool,
}

impl RequestSettings {
    /// Total attempts per logical request, never less than one.
    pub fn attempts(&self) -> u32 {
        self.request_retries
            .map(|retries| retries.saturating_add(1))
            .unwrap_or(self.max_attempts)
            .max(1)
    }
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            max_attempts: 3,
            request_retries: None,
            backoff_min_ms: 50,
            backoff_max_ms: 500,
            jitter: false,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// Time spent open before probing.
    pub open_timeout_ms: u64,

    /// Successful probes needed to close again.
    pub half_open_success_threshold: u32,

    /// Upper bound on tracked destinations (unbounded when absent).
    pub max_breakers: Option<usize>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 30_000,
            half_open_success_threshold: 1,
            max_breakers: None,
        }
    }
}

/// Publish configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishSettings {
    /// Persist publishes in the broker and forward dedup keys.
    #[serde(alias = "durable_publish_enabled")]
    pub durable_enabled: bool,
}

/// Streaming configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Whole-stream deadline, measured from the request send.
    pub timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Worker dispatch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Messages handled concurrently per served destination.
    pub concurrency: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { concurrency: 16 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Propagate W3C trace context through message headers.
    pub trace_enabled: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            trace_enabled: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: BusConfig = toml::from_str("").unwrap();
        assert_eq!(config.request.max_attempts, 3);
        assert_eq!(config.breaker.max_breakers, None);
        assert!(!config.publish.durable_enabled);
        assert_eq!(config.payload_format, PayloadFormat::Json);
    }

    #[test]
    fn test_recognizes_legacy_option_names() {
        let config: BusConfig = toml::from_str(
            r#"
            [request]
            request_retries = 5

            [publish]
            durable_publish_enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.request.attempts(), 6, "five retries after the first attempt");
        assert!(config.publish.durable_enabled);
    }

    #[test]
    fn test_attempts_without_retry_count() {
        let config: BusConfig = toml::from_str("[request]\nmax_attempts = 4").unwrap();
        assert_eq!(config.request.request_retries, None);
        assert_eq!(config.request.attempts(), 4);

        let config: BusConfig = toml::from_str("[request]\nrequest_retries = 0").unwrap();
        assert_eq!(config.request.attempts(), 1);
    }

    #[test]
    fn test_full_config() {
        let config: BusConfig = toml::from_str(
            r#"
            payload_format = "bincode"

            [connection]
            servers = ["nats://bus-a:4222", "nats://bus-b:4222"]
            name = "npc-planner"

            [breaker]
            failure_threshold = 3
            max_breakers = 256

            [observability]
            log_format = "json"
            trace_enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.servers.len(), 2);
        assert_eq!(config.connection.name, "npc-planner");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.max_breakers, Some(256));
        assert_eq!(config.payload_format, PayloadFormat::Bincode);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert!(config.observability.trace_enabled);
    }
}
