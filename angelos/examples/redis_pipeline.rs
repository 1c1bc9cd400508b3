//! Redis Pipeline
//!
//! This example demonstrates:
//! - Producers, workers and the beat as separate processes sharing Redis
//! - Loading settings from a TOML file with environment overrides
//! - Querying task status by id from another process
//!
//! ## Prerequisites
//! ```bash
//! docker run -d -p 6379:6379 redis:7
//! ```
//!
//! ## Run with
//! ```bash
//! # Terminal 1: a pool of workers
//! cargo run --example redis_pipeline --features redis -- worker
//!
//! # Terminal 2: the periodic scheduler (run exactly one)
//! cargo run --example redis_pipeline --features redis -- beat
//!
//! # Terminal 3: submit work and look it up
//! cargo run --example redis_pipeline --features redis -- dispatch email user@example.com
//! cargo run --example redis_pipeline --features redis -- dispatch data 1 2 3 4
//! cargo run --example redis_pipeline --features redis -- status <task-id>
//! ```
//!
//! A config file is optional. Without beat entries the beat runs
//! `tasks.periodic_cleanup` once a day.
//! ```toml
//! broker_url = "redis://127.0.0.1:6379/0"
//! result_ttl_secs = 3600
//!
//! [worker]
//! concurrency = 4
//! pool_size = 2
//!
//! [[beat.entries]]
//! name = "cleanup"
//! task = "tasks.periodic_cleanup"
//! every_secs = 30
//! ```

use angelos::prelude::*;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLEANUP_PERIOD: Duration = Duration::from_secs(86400);

#[derive(Parser)]
#[command(name = "redis_pipeline", about = "Dispatch tasks through Redis")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `broker_url` from the config
    #[arg(long, global = true)]
    broker_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a task
    Dispatch {
        #[command(subcommand)]
        task: DispatchTask,
        /// Wait for the result instead of printing the id
        #[arg(long)]
        wait: bool,
    },
    /// Run a pool of workers until Ctrl-C
    Worker,
    /// Run the periodic scheduler until Ctrl-C
    Beat,
    /// Print the status record of a task
    Status { task_id: String },
}

#[derive(Subcommand)]
enum DispatchTask {
    Email {
        to: String,
        #[arg(long, default_value = "Hello")]
        subject: String,
    },
    Data {
        items: Vec<i64>,
    },
    Echo {
        /// Any JSON value
        payload: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
    body: String,
}

#[task(name = "tasks.send_email_task")]
async fn send_email(email: Email) -> Result<String, String> {
    info!(to = %email.to, "sending email");
    tokio::time::sleep(Duration::from_secs(2)).await;

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
    let items = batch.items;
    let count = items.len();
    let total = tokio::task::spawn_blocking(move || items.iter().sum::<i64>())
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({"processed_items": count, "total": total}))
}

#[task(name = "tasks.echo")]
async fn echo(payload: Value) -> Result<Value, String> {
    Ok(payload)
}

#[task(name = "tasks.periodic_cleanup", idempotent)]
async fn periodic_cleanup() -> Result<String, String> {
    info!("cleaning up");
    Ok("cleanup complete".to_string())
}

fn registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    registry.register_task(send_email)?;
    registry.register_task(process_data)?;
    registry.register_task(echo)?;
    registry.register_task(periodic_cleanup)?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env()?;
            config
        }
    };
    if let Some(url) = cli.broker_url {
        config.broker_url = url;
    }

    let broker = Arc::new(
        RedisBroker::new(&config.broker_url)
            .await?
            .with_result_ttl(config.result_ttl()),
    );
    let dispatcher = Dispatcher::from_broker(broker.clone());

    match cli.command {
        Command::Dispatch { task, wait } => {
            let task_id = match task {
                DispatchTask::Email { to, subject } => {
                    dispatcher
                        .send::<send_email>(&Email {
                            to,
                            subject,
                            body: "Sent from redis_pipeline".into(),
                        })
                        .await?
                }
                DispatchTask::Data { items } => {
                    dispatcher.send::<process_data>(&Batch { items }).await?
                }
                DispatchTask::Echo { payload } => {
                    let payload: Value = serde_json::from_str(&payload)?;
                    dispatcher.send::<echo>(&payload).await?
                }
            };

            if wait {
                let record = dispatcher
                    .wait(&task_id, Duration::from_millis(200), Duration::from_secs(60))
                    .await?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("{task_id}");
            }
        }
        Command::Worker => {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
            let prefix = format!("{}-{}-{}", config.worker.id_prefix, hostname, std::process::id());
            let template = Worker::from_broker(broker.clone(), Arc::new(registry()?), prefix)
                .with_structured_tracing();
            let pool = config.worker_pool(template).start();
            info!(workers = ?pool.worker_ids(), "workers started, Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("draining in-flight tasks");
            pool.shutdown().await;
        }
        Command::Beat => {
            let mut beat = config.beat(dispatcher)?;
            if beat.entries().is_empty() {
                beat = beat.with_entry(ScheduleEntry::new(
                    "cleanup-every-day",
                    <periodic_cleanup as Task>::NAME,
                    CLEANUP_PERIOD,
                ));
            }
            info!(entries = beat.entries().len(), "beat started, Ctrl-C to stop");
            let handle = beat.start();

            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
        }
        Command::Status { task_id } => match dispatcher.query(&TaskId::from(task_id)).await {
            Ok(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            Err(DispatchError::NotFound(id)) => println!("{id}: not found (never submitted or expired)"),
            Err(e) => return Err(e.into()),
        },
    }

    Ok(())
}
