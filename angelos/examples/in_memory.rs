//! In-Memory Dispatch Demo
//!
//! This example demonstrates:
//! - Declaring tasks with `#[task]`
//! - Running a pool of workers with structured tracing
//! - Submitting work and waiting for results through a dispatcher
//! - A beat submitting a periodic task alongside ad-hoc submissions
//!
//! ## Scenario
//! A web backend offloads email delivery and batch processing. A periodic
//! cleanup runs every two seconds. Everything lives in one process, using
//! the in-memory broker as both message channel and result store.
//!
//! ## Run with
//! ```bash
//! cargo run --example in_memory
//! RUST_LOG=angelos=debug cargo run --example in_memory
//! ```

use angelos::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
    body: String,
}

#[task(name = "tasks.send_email_task")]
async fn send_email(email: Email) -> Result<String, String> {
    info!(to = %email.to, bytes = email.body.len(), "sending email");
    tokio::time::sleep(Duration::from_millis(200)).await;

    if !email.to.contains('@') {
        return Err(format!("invalid recipient: {}", email.to));
    }
    Ok(format!("Email sent to {}: {}", email.to, email.subject))
}

#[derive(Debug, Serialize, Deserialize)]
struct Batch {
    items: Vec<i64>,
}

#[task(name = "tasks.process_data_task")]
async fn process_data(batch: Batch) -> Result<Value, String> {
    // CPU-heavy work belongs on the blocking pool.
    let items = batch.items;
    let total = tokio::task::spawn_blocking(move || items.iter().map(|n| n * n).sum::<i64>())
        .await
        .map_err(|e| e.to_string())?;

    Ok(json!({"sum_of_squares": total}))
}

#[task(name = "tasks.periodic_cleanup", idempotent)]
async fn periodic_cleanup() -> Result<String, String> {
    info!("cleaning up expired sessions");
    Ok("cleanup complete".to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let broker = Arc::new(InMemoryBroker::new());

    let mut registry = Registry::new();
    registry.register_task(send_email)?;
    registry.register_task(process_data)?;
    registry.register_task(periodic_cleanup)?;
    let registry = Arc::new(registry);

    let template = Worker::from_broker(broker.clone(), registry, "worker")
        .with_structured_tracing()
        .with_concurrency(2)
        .with_task_timeout(Duration::from_secs(10));
    let pool = WorkerPool::new(template).with_size(2).start();
    info!(workers = ?pool.worker_ids(), "worker pool started");

    let dispatcher = Dispatcher::from_broker(broker.clone());
    let beat = Beat::new(dispatcher.clone())
        .with_entry(ScheduleEntry::new(
            "cleanup-every-2s",
            <periodic_cleanup as Task>::NAME,
            Duration::from_secs(2),
        ))
        .with_tick_interval(Duration::from_millis(250))
        .start();

    let submitted = vec![
        dispatcher
            .send::<send_email>(&Email {
                to: "user@example.com".into(),
                subject: "Welcome".into(),
                body: "Thanks for signing up".into(),
            })
            .await?,
        dispatcher
            .send::<send_email>(&Email {
                to: "not-an-address".into(),
                subject: "Oops".into(),
                body: "This one fails".into(),
            })
            .await?,
        dispatcher
            .send::<process_data>(&Batch {
                items: (1..=1000).collect(),
            })
            .await?,
        dispatcher.submit("tasks.unknown", json!({})).await?,
    ];

    for task_id in &submitted {
        let record = dispatcher
            .wait(task_id, Duration::from_millis(50), Duration::from_secs(10))
            .await?;
        match record.state {
            TaskState::Success => println!("{task_id}: SUCCESS {:?}", record.result),
            state => println!("{task_id}: {state} {:?}", record.error),
        }
    }

    // Let the beat fire a couple more times.
    tokio::time::sleep(Duration::from_secs(5)).await;

    beat.shutdown().await;
    pool.shutdown().await;
    info!(
        queued = broker.queued_len(),
        in_flight = broker.in_flight_len(),
        "shut down"
    );
    Ok(())
}
