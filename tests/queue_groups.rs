//! Queue-group dispatch tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bus_client::{BoxError, BusError, MemoryBroker, RequestOptions};

mod common;
use common::{connect, plan, test_config, PlanRequest, PlanResponse};

async fn start_planners(broker: &MemoryBroker, count: usize) -> (Vec<bus_client::BusClient>, Vec<bus_client::ServeHandle>) {
    let mut clients = Vec::new();
    let mut handles = Vec::new();
    for id in 0..count {
        let name = format!("planner-{}", id);
        let client = connect(broker, &name, test_config()).await;
        let handle = client
            .serve("ai.plan", "planners", move |req: PlanRequest| {
                let name = name.clone();
                async move {
                    Ok::<_, BoxError>(PlanResponse {
                        agent_id: req.agent_id,
                        worker: name,
                    })
                }
            })
            .await
            .unwrap();
        clients.push(client);
        handles.push(handle);
    }
    (clients, handles)
}

#[tokio::test]
async fn test_each_request_handled_by_exactly_one_member() {
    let broker = MemoryBroker::new();
    let (_workers, _handles) = start_planners(&broker, 3).await;
    let caller = connect(&broker, "caller", test_config()).await;

    let mut per_worker: HashMap<String, u32> = HashMap::new();
    for i in 0..60 {
        let reply: PlanResponse = caller.request_typed("ai.plan", &plan(i)).await.unwrap();
        assert_eq!(reply.agent_id, i);
        *per_worker.entry(reply.worker).or_default() += 1;
    }

    assert_eq!(per_worker.values().sum::<u32>(), 60);
    assert!(per_worker.len() > 1, "load should spread across the group: {:?}", per_worker);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_connection() {
    let broker = MemoryBroker::new();
    let (_workers, _handles) = start_planners(&broker, 2).await;
    let caller = connect(&broker, "caller", test_config()).await;

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let caller = caller.clone();
            tokio::spawn(async move {
                caller
                    .request_typed::<_, PlanResponse>("ai.plan", &plan(i))
                    .await
                    .map(|reply| reply.agent_id)
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), i as u32);
    }
    assert_eq!(caller.stats().in_flight, 0);
}

#[tokio::test]
async fn test_handler_error_means_no_reply() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;

    let _serve = worker
        .serve("ai.plan", "planners", |req: PlanRequest| async move {
            if req.agent_id % 2 == 1 {
                return Err("cannot plan for odd agents".into());
            }
            Ok::<_, BoxError>(PlanResponse {
                agent_id: req.agent_id,
                worker: "w".into(),
            })
        })
        .await
        .unwrap();

    let once = RequestOptions::default().max_attempts(1);
    let err = caller
        .request_typed_with::<_, PlanResponse>("ai.plan", &plan(1), once.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ServiceTimeout { attempts: 1, .. }), "{:?}", err);

    let reply: PlanResponse = caller
        .request_typed_with("ai.plan", &plan(2), once)
        .await
        .unwrap();
    assert_eq!(reply.agent_id, 2, "dispatch loop survives handler errors");
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let serve = worker
        .serve("ai.plan", "planners", move |req: PlanRequest| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    panic!("planner crashed");
                }
                Ok::<_, BoxError>(PlanResponse {
                    agent_id: req.agent_id,
                    worker: "w".into(),
                })
            }
        })
        .await
        .unwrap();

    let reply: PlanResponse = caller.request_typed("ai.plan", &plan(5)).await.unwrap();
    assert_eq!(reply.agent_id, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "first attempt panicked, retry answered");
    assert!(serve.is_active());
}

#[tokio::test]
async fn test_stopping_a_worker_removes_it_from_the_group() {
    let broker = MemoryBroker::new();
    let (_workers, mut handles) = start_planners(&broker, 2).await;
    assert_eq!(broker.subscriber_count("ai.plan"), 2);

    handles.pop().unwrap().stop();
    assert!(common::eventually(|| broker.subscriber_count("ai.plan") == 1).await);

    handles.pop().unwrap().stop();
    assert!(common::eventually(|| broker.subscriber_count("ai.plan") == 0).await);

    let caller = connect(&broker, "caller", test_config()).await;
    let err = caller
        .request_typed::<_, PlanResponse>("ai.plan", &plan(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ServiceUnavailable { .. }));
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let broker = MemoryBroker::new();
    let mut config = test_config();
    config.dispatch.concurrency = 2;
    let worker = connect(&broker, "worker", config).await;
    let caller = connect(&broker, "caller", test_config()).await;

    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let (a, p) = (active.clone(), peak.clone());
    let _serve = worker
        .serve("ai.slow", "slow", move |req: PlanRequest| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, BoxError>(PlanResponse {
                    agent_id: req.agent_id,
                    worker: "w".into(),
                })
            }
        })
        .await
        .unwrap();

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let caller = caller.clone();
            tokio::spawn(async move {
                caller
                    .request_typed_with::<_, PlanResponse>(
                        "ai.slow",
                        &plan(i),
                        RequestOptions::default().timeout(Duration::from_secs(2)),
                    )
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}
