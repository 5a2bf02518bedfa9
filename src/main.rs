//! `bus-soak`: exercise the client library against an in-process broker
//! (or a NATS server when built with the `nats` feature).
//!
//! Starts a group of planner workers and a streaming pathfinder, fires
//! concurrent requests at them while injecting handler failures, slow replies
//! and an optional broker outage, then reports outcomes and breaker states.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use bus_client::config::{load_config, LogFormat};
use bus_client::observability::{logging, metrics};
use bus_client::{
    BusClient, BusConfig, ChunkSender, Connector, HandlerResult, MemoryBroker, Schema,
};

const PLAN_SUBJECT: &str = "ai.npc.plan";
const PATH_SUBJECT: &str = "ai.npc.path";
const EVENT_SUBJECT: &str = "ai.npc.events";
const WORKER_GROUP: &str = "planners";

#[derive(Parser, Debug)]
#[command(name = "bus-soak")]
#[command(about = "Soak test for the message-bus client over an in-process broker", long_about = None)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Planner workers in the queue group.
    #[arg(short, long, default_value_t = 3)]
    workers: usize,

    /// Total plan requests to send.
    #[arg(short, long, default_value_t = 200)]
    requests: usize,

    /// Requests in flight at once.
    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    /// Probability that a worker handler fails (no reply).
    #[arg(long, default_value_t = 0.05)]
    failure_rate: f64,

    /// Probability that a worker replies slower than the request timeout.
    #[arg(long, default_value_t = 0.02)]
    slow_rate: f64,

    /// Interrupt the in-process broker for this many milliseconds.
    #[arg(long, default_value_t = 0)]
    outage_ms: u64,

    /// Talk to the configured NATS servers instead of the in-process broker.
    #[cfg(feature = "nats")]
    #[arg(long)]
    nats: bool,

    /// Waypoints per streamed path.
    #[arg(long, default_value_t = 8)]
    path_len: u32,

    /// Emit JSON logs.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanRequest {
    agent_id: u32,
    goal: String,
}

impl Schema for PlanRequest {
    fn schema_name() -> &'static str {
        "ai.PlanRequest"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanResponse {
    agent_id: u32,
    steps: Vec<String>,
    #[serde(default)]
    worker: String,
}

impl Schema for PlanResponse {
    fn schema_name() -> &'static str {
        "ai.PlanResponse"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PathRequest {
    agent_id: u32,
    waypoints: u32,
}

impl Schema for PathRequest {
    fn schema_name() -> &'static str {
        "ai.PathRequest"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Waypoint {
    index: u32,
    x: i32,
    y: i32,
}

impl Schema for Waypoint {
    fn schema_name() -> &'static str {
        "ai.Waypoint"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanCompleted {
    agent_id: u32,
    steps: usize,
}

impl Schema for PlanCompleted {
    fn schema_name() -> &'static str {
        "ai.PlanCompleted"
    }
}

#[derive(Debug, Default, Serialize)]
struct Report {
    requests: usize,
    outcomes: BTreeMap<&'static str, usize>,
    events_published: usize,
    stream_chunks: usize,
    stream_outcome: String,
    elapsed_ms: u64,
    tripped: Vec<String>,
    caller: Option<bus_client::ConnectionStats>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BusConfig::default(),
    };
    if cli.json {
        config.observability.log_format = LogFormat::Json;
    }
    logging::init_logging(&config.observability);

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        workers = cli.workers,
        requests = cli.requests,
        concurrency = cli.concurrency,
        failure_rate = cli.failure_rate,
        "bus-soak starting"
    );

    let broker = MemoryBroker::new();
    let connector = select_connector(&cli, &broker);
    let mut workers = Vec::with_capacity(cli.workers);
    let mut handles = Vec::new();

    for id in 0..cli.workers {
        let mut worker_config = config.clone();
        worker_config.connection.name = format!("planner-{}", id);
        let worker = BusClient::connect(&worker_config, connector.as_ref()).await?;

        let name = worker_config.connection.name.clone();
        let failure_rate = cli.failure_rate;
        let slow_rate = cli.slow_rate;
        let slow_delay = Duration::from_millis(config.request.timeout_ms + 50);
        handles.push(
            worker
                .serve(PLAN_SUBJECT, WORKER_GROUP, move |req: PlanRequest| {
                    let name = name.clone();
                    async move { plan(req, name, failure_rate, slow_rate, slow_delay).await }
                })
                .await?,
        );
        handles.push(
            worker
                .serve_stream(PATH_SUBJECT, WORKER_GROUP, |req: PathRequest, tx: ChunkSender| {
                    stream_path(req, tx)
                })
                .await?,
        );
        workers.push(worker);
    }

    let mut caller_config = config.clone();
    caller_config.connection.name = "soak-caller".to_string();
    let caller = BusClient::connect(&caller_config, connector.as_ref()).await?;

    let _events = caller
        .subscribe(EVENT_SUBJECT, |event: PlanCompleted, _headers, _reply_to| async move {
            tracing::trace!(agent_id = event.agent_id, steps = event.steps, "Plan completed");
            Ok::<_, bus_client::BoxError>(())
        })
        .await?;

    if cli.outage_ms > 0 {
        let broker = broker.clone();
        let caller = caller.clone();
        let outage = Duration::from_millis(cli.outage_ms);
        tokio::spawn(async move {
            tokio::time::sleep(outage).await;
            tracing::warn!(outage_ms = outage.as_millis() as u64, "Injecting broker outage");
            broker.interrupt();
            tokio::time::sleep(outage).await;
            broker.restore();
            // Failures during the outage say nothing about the workers.
            caller.breakers().reset_all();
            tracing::info!("Broker restored");
        });
    }

    let start = Instant::now();
    let mut report = Report {
        requests: cli.requests,
        ..Report::default()
    };

    let results: Vec<_> = futures_util::stream::iter(0..cli.requests)
        .map(|i| {
            let caller = caller.clone();
            async move {
                let req = PlanRequest {
                    agent_id: i as u32,
                    goal: "reach_cover".to_string(),
                };
                let result = caller
                    .request_typed::<PlanRequest, PlanResponse>(PLAN_SUBJECT, &req)
                    .await;
                if let Ok(plan) = &result {
                    let event = PlanCompleted {
                        agent_id: plan.agent_id,
                        steps: plan.steps.len(),
                    };
                    let key = format!("plan-{}", plan.agent_id);
                    if let Err(e) = caller.publish(EVENT_SUBJECT, &event, Some(&key)).await {
                        tracing::warn!(error = %e, "Event publish failed");
                        return (result.map(|_| ()), false);
                    }
                    return (Ok(()), true);
                }
                (result.map(|_| ()), false)
            }
        })
        .buffer_unordered(cli.concurrency.max(1))
        .collect()
        .await;

    for (result, published) in results {
        let outcome = match result {
            Ok(()) => "success",
            Err(e) => e.kind(),
        };
        *report.outcomes.entry(outcome).or_default() += 1;
        if published {
            report.events_published += 1;
        }
    }

    match caller
        .request_stream::<PathRequest, Waypoint>(
            PATH_SUBJECT,
            &PathRequest {
                agent_id: 0,
                waypoints: cli.path_len,
            },
        )
        .await
    {
        Ok(stream) => match stream.collect().await {
            Ok(waypoints) => {
                report.stream_chunks = waypoints.len();
                report.stream_outcome = "success".to_string();
            }
            Err(e) => report.stream_outcome = e.kind().to_string(),
        },
        Err(e) => report.stream_outcome = e.kind().to_string(),
    }

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    report.tripped = caller.breakers().tripped();
    report.caller = Some(caller.stats());

    for snapshot in caller.breakers().snapshot() {
        tracing::info!(
            destination = %snapshot.destination,
            state = %snapshot.state,
            failures = snapshot.failure_count,
            "Breaker state"
        );
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    drop(handles);
    if let Err(e) = caller.close().await {
        tracing::warn!(error = %e, "Caller did not drain cleanly");
    }
    for worker in &workers {
        if let Err(e) = worker.close().await {
            tracing::warn!(error = %e, "Worker did not drain cleanly");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg_attr(not(feature = "nats"), allow(unused_variables))]
fn select_connector(cli: &Cli, broker: &MemoryBroker) -> Box<dyn Connector> {
    #[cfg(feature = "nats")]
    if cli.nats {
        return Box::new(bus_client::NatsConnector::new());
    }
    Box::new(broker.clone())
}

async fn plan(
    req: PlanRequest,
    worker: String,
    failure_rate: f64,
    slow_rate: f64,
    slow_delay: Duration,
) -> HandlerResult<PlanResponse> {
    let roll = fastrand::f64();
    if roll < failure_rate {
        return Err(format!("planner could not reach goal '{}'", req.goal).into());
    }
    if roll < failure_rate + slow_rate {
        tokio::time::sleep(slow_delay).await;
    } else {
        tokio::time::sleep(Duration::from_millis(fastrand::u64(1..10))).await;
    }

    Ok(PlanResponse {
        agent_id: req.agent_id,
        steps: vec![
            "scan".to_string(),
            format!("move_to:{}", req.goal),
            "crouch".to_string(),
        ],
        worker,
    })
}

async fn stream_path(req: PathRequest, tx: ChunkSender) -> HandlerResult<()> {
    for index in 0..req.waypoints {
        let waypoint = Waypoint {
            index,
            x: index as i32 * 2,
            y: (req.agent_id % 7) as i32 - index as i32,
        };
        if index + 1 == req.waypoints {
            tx.send_final(&waypoint).await?;
        } else {
            tx.send(&waypoint).await?;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Ok(())
}
