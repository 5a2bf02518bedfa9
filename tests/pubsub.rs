//! Publish/subscribe tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus_client::codec::headers::{MSG_ID, TRACEPARENT};
use bus_client::observability::TraceContext;
use bus_client::{BoxError, BusError, Headers, MemoryBroker};
use tokio::sync::mpsc;

mod common;
use common::{capture, connect, eventually, plan, raw_link, test_config, within, PlanRequest};

fn durable_config() -> bus_client::BusConfig {
    let mut config = test_config();
    config.publish.durable_enabled = true;
    config
}

#[tokio::test]
async fn test_best_effort_publish_without_subscribers() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, "npc", test_config()).await;

    let ack = client.publish("ai.events.plan_completed", &plan(1), None).await.unwrap();
    assert!(ack.is_none());
    assert_eq!(broker.stored_count(), 0);
}

#[tokio::test]
async fn test_durable_publish_suppresses_duplicates() {
    let broker = MemoryBroker::new();
    let publisher = connect(&broker, "npc", durable_config()).await;
    let consumer = connect(&broker, "analytics", test_config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = consumer
        .subscribe("ai.events", move |event: PlanRequest, headers: Headers, _reply_to| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((event.agent_id, headers.get(MSG_ID).map(str::to_string)));
                Ok::<_, BoxError>(())
            }
        })
        .await
        .unwrap();

    let first = publisher
        .publish("ai.events", &plan(7), Some("plan-7"))
        .await
        .unwrap()
        .unwrap();
    let second = publisher
        .publish("ai.events", &plan(7), Some("plan-7"))
        .await
        .unwrap()
        .unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(broker.stored_count(), 1);

    let delivered = within(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(delivered, (7, Some("plan-7".to_string())));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err(), "duplicate must not be delivered");
}

#[tokio::test]
async fn test_distinct_dedup_keys_are_both_stored() {
    let broker = MemoryBroker::new();
    let publisher = connect(&broker, "npc", durable_config()).await;

    publisher.publish("ai.events", &plan(1), Some("a")).await.unwrap();
    publisher.publish("ai.events", &plan(1), Some("b")).await.unwrap();
    publisher.publish("ai.events", &plan(1), None).await.unwrap();
    assert_eq!(broker.stored_count(), 3);
}

#[tokio::test]
async fn test_handler_failures_do_not_stop_subscription() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, "npc", test_config()).await;
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&seen);
    let handle = client
        .subscribe("ai.events", move |event: PlanRequest, _headers, _reply_to| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                match event.agent_id {
                    1 => Err("bad event".into()),
                    2 => panic!("handler bug"),
                    _ => Ok::<_, BoxError>(()),
                }
            }
        })
        .await
        .unwrap();

    for id in 1..=3 {
        client.publish("ai.events", &plan(id), None).await.unwrap();
    }
    // Undecodable payloads are dropped without reaching the handler.
    let link = raw_link(&broker, "raw").await;
    link.publish("ai.events", bus_client::Envelope::new("not json"))
        .await
        .unwrap();
    client.publish("ai.events", &plan(4), None).await.unwrap();

    assert!(eventually(|| seen.load(Ordering::SeqCst) == 4).await);
    assert!(handle.is_active());
}

#[tokio::test]
async fn test_wildcard_subscription() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, "npc", test_config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = client
        .subscribe("ai.events.>", move |event: PlanRequest, _headers, _reply_to| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.agent_id);
                Ok::<_, BoxError>(())
            }
        })
        .await
        .unwrap();

    client.publish("ai.events.plan_completed", &plan(1), None).await.unwrap();
    client.publish("ai.events.npc.died", &plan(2), None).await.unwrap();
    client.publish("ai.other", &plan(3), None).await.unwrap();

    let mut ids = vec![
        within(Duration::from_secs(1), rx.recv()).await.unwrap(),
        within(Duration::from_secs(1), rx.recv()).await.unwrap(),
    ];
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dropping_handle_unsubscribes() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, "npc", test_config()).await;

    let handle = client
        .subscribe("ai.events", |_event: PlanRequest, _headers, _reply_to| async move {
            Ok::<_, BoxError>(())
        })
        .await
        .unwrap();
    assert_eq!(handle.subject(), "ai.events");
    assert!(eventually(|| broker.subscriber_count("ai.events") == 1).await);

    handle.unsubscribe();
    assert!(eventually(|| broker.subscriber_count("ai.events") == 0).await);
}

#[tokio::test]
async fn test_trace_context_reaches_subscriber() {
    let broker = MemoryBroker::new();
    let mut config = test_config();
    config.observability.trace_enabled = true;
    let publisher = connect(&broker, "npc", config.clone()).await;
    let consumer = connect(&broker, "analytics", config).await;

    let link = raw_link(&broker, "observer").await;
    let mut raw = capture(&link, "ai.events").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = consumer
        .subscribe("ai.events", move |_event: PlanRequest, _headers, _reply_to| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(TraceContext::current());
                Ok::<_, BoxError>(())
            }
        })
        .await
        .unwrap();

    let root = TraceContext::new_root();
    root.scope(async {
        publisher.publish("ai.events", &plan(1), None).await.unwrap();
    })
    .await;

    let message = within(Duration::from_secs(1), raw.recv()).await.unwrap();
    let traceparent = message.envelope.headers.get(TRACEPARENT).unwrap();
    let sent = TraceContext::parse(traceparent).unwrap();
    assert_eq!(sent.trace_id, root.trace_id);
    assert_ne!(sent.span_id, root.span_id);

    let seen = within(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen.trace_id, root.trace_id);
}

#[tokio::test]
async fn test_no_trace_header_when_disabled() {
    let broker = MemoryBroker::new();
    let publisher = connect(&broker, "npc", test_config()).await;
    let link = raw_link(&broker, "observer").await;
    let mut raw = capture(&link, "ai.events").await;

    TraceContext::new_root()
        .scope(publisher.publish("ai.events", &plan(1), None))
        .await
        .unwrap();

    let message = within(Duration::from_secs(1), raw.recv()).await.unwrap();
    assert!(!message.envelope.headers.contains(TRACEPARENT));
}

#[tokio::test]
async fn test_publish_after_close_fails() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, "npc", test_config()).await;
    client.close().await.unwrap();

    let err = client.publish("ai.events", &plan(1), None).await.unwrap_err();
    assert!(matches!(err, BusError::Closed), "{:?}", err);
}
