//! Streaming request tests.

use std::time::Duration;

use bus_client::codec::headers::{CONTENT_TYPE, STREAM_FINAL};
use bus_client::{BoxError, BusError, ChunkSender, Envelope, Headers, MemoryBroker};
use futures_util::StreamExt;

mod common;
use common::{connect, plan, test_config, PlanRequest, Waypoint};

async fn send_path(req: PlanRequest, tx: ChunkSender) -> Result<(), BoxError> {
    for index in 0..req.agent_id {
        let waypoint = Waypoint { index };
        if index + 1 == req.agent_id {
            tx.send_final(&waypoint).await?;
        } else {
            tx.send(&waypoint).await?;
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_stream_ends_at_final_chunk() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;
    let _serve = worker.serve_stream("ai.path", "pathfinders", send_path).await.unwrap();

    let mut stream = caller
        .request_stream::<_, Waypoint>("ai.path", &plan(4))
        .await
        .unwrap();

    let mut indices = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        assert_eq!(chunk.is_final, chunk.payload.index == 3);
        indices.push(chunk.payload.index);
    }
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert!(stream.is_finished());
    assert!(stream.next().await.is_none(), "a finished stream stays finished");
}

#[tokio::test]
async fn test_nothing_is_yielded_after_the_final_chunk() {
    let broker = MemoryBroker::new();
    let responder = common::raw_link(&broker, "responder").await;
    let mut requests = responder.subscribe("ai.path", Some("pathfinders")).await.unwrap();
    let caller = connect(&broker, "caller", test_config()).await;

    let link = responder.clone();
    tokio::spawn(async move {
        let request = requests.next().await.unwrap();
        let reply_to = request.envelope.reply_to.unwrap();
        for index in 0..5u32 {
            let mut headers = Headers::new();
            headers.insert(CONTENT_TYPE, "application/json");
            headers.insert(STREAM_FINAL, if index == 2 { "true" } else { "false" });
            let payload = serde_json::to_vec(&Waypoint { index }).unwrap();
            link.publish(&reply_to, Envelope::new(payload).with_headers(headers))
                .await
                .unwrap();
        }
    });

    let stream = caller
        .request_stream::<_, Waypoint>("ai.path", &plan(1))
        .await
        .unwrap();
    let chunks: Vec<_> = stream.into_stream().collect().await;
    assert_eq!(chunks.len(), 3, "final chunk at index 2 yields exactly 3 chunks");
    assert!(chunks[2].as_ref().unwrap().is_final);
}

#[tokio::test]
async fn test_handler_without_final_chunk_gets_end_marker() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;
    let _serve = worker
        .serve_stream("ai.path", "pathfinders", |_req: PlanRequest, tx: ChunkSender| async move {
            tx.send(&Waypoint { index: 0 }).await?;
            tx.send(&Waypoint { index: 1 }).await?;
            Ok::<_, BoxError>(())
        })
        .await
        .unwrap();

    let waypoints = caller
        .request_stream::<_, Waypoint>("ai.path", &plan(0))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(waypoints, vec![Waypoint { index: 0 }, Waypoint { index: 1 }]);
    assert_eq!(
        caller.breakers().get("ai.path").unwrap().snapshot().failure_count,
        0
    );
}

#[tokio::test]
async fn test_error_chunk_ends_stream_with_error() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;
    let _serve = worker
        .serve_stream("ai.path", "pathfinders", |_req: PlanRequest, tx: ChunkSender| async move {
            tx.send(&Waypoint { index: 0 }).await?;
            Err::<(), BoxError>("navmesh missing".into())
        })
        .await
        .unwrap();

    let mut stream = caller
        .request_stream::<_, Waypoint>("ai.path", &plan(0))
        .await
        .unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap().payload.index, 0);
    match stream.next().await {
        Some(Err(BusError::Stream { reason, .. })) => assert!(reason.contains("navmesh missing")),
        other => panic!("expected stream error, got {:?}", other),
    }
    assert!(stream.next().await.is_none());
    assert_eq!(
        caller.breakers().get("ai.path").unwrap().snapshot().failure_count,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_whole_stream_deadline() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;
    let _serve = worker
        .serve_stream("ai.path", "pathfinders", |_req: PlanRequest, tx: ChunkSender| async move {
            for index in 0..100 {
                tx.send(&Waypoint { index }).await?;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok::<_, BoxError>(())
        })
        .await
        .unwrap();
    let baseline = broker.subscription_count();

    let mut stream = caller
        .request_stream_with::<_, Waypoint>("ai.path", &plan(0), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(broker.subscription_count(), baseline + 1);

    let started = tokio::time::Instant::now();
    let mut received = 0;
    let err = loop {
        match stream.next().await {
            Some(Ok(_)) => received += 1,
            Some(Err(e)) => break e,
            None => panic!("stream ended without timing out"),
        }
    };

    // Chunks every 200ms never reset a 500ms whole-stream deadline.
    assert_eq!(received, 3);
    assert!(matches!(err, BusError::ServiceTimeout { timeout_ms: 500, .. }), "{:?}", err);
    assert!(started.elapsed() <= Duration::from_millis(500));
    assert_eq!(broker.subscription_count(), baseline, "inbox released on timeout");
}

#[tokio::test]
async fn test_dropping_stream_releases_inbox() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;
    let _serve = worker.serve_stream("ai.path", "pathfinders", send_path).await.unwrap();
    let baseline = broker.subscription_count();

    let mut stream = caller
        .request_stream::<_, Waypoint>("ai.path", &plan(10))
        .await
        .unwrap();
    stream.next().await.unwrap().unwrap();
    assert_eq!(broker.subscription_count(), baseline + 1);

    drop(stream);
    assert_eq!(broker.subscription_count(), baseline);
    assert_eq!(caller.stats().in_flight, 0);
}

#[tokio::test]
async fn test_stream_without_responders() {
    let broker = MemoryBroker::new();
    let caller = connect(&broker, "caller", test_config()).await;

    let err = caller
        .request_stream::<_, Waypoint>("ai.path", &plan(3))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ServiceUnavailable { .. }), "{:?}", err);
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_sender_rejects_chunks_after_final() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _serve = worker
        .serve_stream("ai.path", "pathfinders", move |_req: PlanRequest, sender: ChunkSender| {
            let tx = tx.clone();
            async move {
                sender.send_final(&Waypoint { index: 0 }).await?;
                let late = sender.send(&Waypoint { index: 1 }).await;
                let _ = tx.send(late.is_err());
                Ok::<_, BoxError>(())
            }
        })
        .await
        .unwrap();

    let waypoints = caller
        .request_stream::<_, Waypoint>("ai.path", &plan(0))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(waypoints.len(), 1);
    assert_eq!(rx.recv().await, Some(true));
}

#[tokio::test]
async fn test_undecodable_stream_request_is_reported_to_consumer() {
    let broker = MemoryBroker::new();
    let worker = connect(&broker, "worker", test_config()).await;
    let caller = connect(&broker, "caller", test_config()).await;
    let _serve = worker.serve_stream("ai.path", "pathfinders", send_path).await.unwrap();

    // The responder expects a PlanRequest; a Waypoint carries another schema.
    let mut stream = caller
        .request_stream::<_, Waypoint>("ai.path", &Waypoint { index: 1 })
        .await
        .unwrap();

    match stream.next().await {
        Some(Err(BusError::Stream { reason, .. })) => assert!(reason.contains("schema mismatch"), "{}", reason),
        other => panic!("expected stream error, got {:?}", other),
    }
    assert!(stream.next().await.is_none());
}
