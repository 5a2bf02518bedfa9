//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define client metrics (requests, attempts, breaker activity, publishes)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-destination and aggregate metrics
//!
//! # Metrics
//! - `bus_requests_total` (counter): logical requests by destination, outcome
//! - `bus_request_duration_seconds` (histogram): end-to-end latency including retries
//! - `bus_request_attempts_total` (counter): physical attempts by destination, result
//! - `bus_breaker_transitions_total` (counter): state changes by destination, state
//! - `bus_breaker_rejections_total` (counter): calls refused while open
//! - `bus_publishes_total` (counter): publishes by destination, mode, outcome
//! - `bus_handler_errors_total` (counter): subscriber/worker handler failures
//! - `bus_stream_chunks_total` (counter): stream chunks received
//! - `bus_connection_events_total` (counter): link lifecycle events
//! - `bus_connected` (gauge): 1=connected, 0=disconnected
//! - `bus_in_flight` (gauge): outstanding exchanges
//!
//! # Design Decisions
//! - Without an installed recorder every helper is a no-op
//! - Labels for destination and outcome, never for payload content

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a finished logical request.
pub fn record_request(destination: &str, outcome: &'static str, start: Instant) {
    let labels = [
        ("destination", destination.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("bus_requests_total", &labels).increment(1);
    histogram!("bus_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

/// Record one physical attempt.
pub fn record_attempt(destination: &str, result: &'static str) {
    counter!(
        "bus_request_attempts_total",
        "destination" => destination.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_breaker_transition(destination: &str, state: &'static str) {
    counter!(
        "bus_breaker_transitions_total",
        "destination" => destination.to_string(),
        "state" => state
    )
    .increment(1);
}

pub fn record_breaker_rejection(destination: &str) {
    counter!("bus_breaker_rejections_total", "destination" => destination.to_string())
        .increment(1);
}

pub fn record_publish(destination: &str, mode: &'static str, outcome: &'static str) {
    counter!(
        "bus_publishes_total",
        "destination" => destination.to_string(),
        "mode" => mode,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_handler_error(destination: &str, kind: &'static str) {
    counter!(
        "bus_handler_errors_total",
        "destination" => destination.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_stream_chunk(destination: &str) {
    counter!("bus_stream_chunks_total", "destination" => destination.to_string()).increment(1);
}

pub fn record_connection_event(event: &'static str) {
    counter!("bus_connection_events_total", "event" => event).increment(1);
}

pub fn record_connected(connected: bool) {
    gauge!("bus_connected").set(if connected { 1.0 } else { 0.0 });
}

pub fn record_in_flight(count: u64) {
    gauge!("bus_in_flight").set(count as f64);
}
