//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bus_client::transport::{ConnectOptions, IncomingMessage};
use bus_client::{BusClient, BusConfig, Connector, MemoryBroker, Schema, Transport};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub agent_id: u32,
    pub goal: String,
}

impl Schema for PlanRequest {
    fn schema_name() -> &'static str {
        "ai.PlanRequest"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    pub agent_id: u32,
    pub worker: String,
}

impl Schema for PlanResponse {
    fn schema_name() -> &'static str {
        "ai.PlanResponse"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub index: u32,
}

impl Schema for Waypoint {
    fn schema_name() -> &'static str {
        "ai.Waypoint"
    }
}

pub fn plan(agent_id: u32) -> PlanRequest {
    PlanRequest {
        agent_id,
        goal: "reach_cover".to_string(),
    }
}

/// Configuration with short deadlines suited to tests.
pub fn test_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.connection.connect_timeout_ms = 500;
    config.connection.drain_grace_ms = 500;
    config.request.timeout_ms = 100;
    config.request.max_attempts = 3;
    config.request.backoff_min_ms = 50;
    config.request.backoff_max_ms = 500;
    config.request.jitter = false;
    config.breaker.failure_threshold = 5;
    config.breaker.open_timeout_ms = 1_000;
    config.stream.timeout_ms = 500;
    config
}

pub async fn connect(broker: &MemoryBroker, name: &str, mut config: BusConfig) -> BusClient {
    config.connection.name = name.to_string();
    BusClient::connect(&config, broker).await.unwrap()
}

/// A bare transport link, bypassing the client, for observing raw traffic.
pub async fn raw_link(broker: &MemoryBroker, name: &str) -> Arc<dyn Transport> {
    let (tx, _rx) = mpsc::unbounded_channel();
    broker
        .connect(
            &ConnectOptions {
                servers: vec!["memory://local".to_string()],
                name: name.to_string(),
                headers_enabled: true,
            },
            tx,
        )
        .await
        .unwrap()
}

/// Forward every raw message on `subject` to a channel.
pub async fn capture(
    link: &Arc<dyn Transport>,
    subject: &str,
) -> mpsc::UnboundedReceiver<IncomingMessage> {
    let mut subscription = link.subscribe(subject, None).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = subscription.next().await {
            if tx.send(message).is_err() {
                break;
            }
        }
    });
    rx
}

/// Poll `condition` until it holds, yielding to other tasks in between.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

/// Run `f` and fail the test if it takes longer than `limit`.
pub async fn within<T>(limit: Duration, f: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, f)
        .await
        .expect("operation did not finish in time")
}
