//! Angelos: asynchronous task dispatch for Rust
//!
//! `angelos` (ἄγγελος, Greek for "messenger") hands long-running or
//! CPU-heavy work from a request-serving process to a pool of workers
//! through a durable broker, tracks every unit of work by an opaque id,
//! and can submit tasks on a fixed schedule.
//!
//! # Features
//!
//! - **Broker-mediated queueing**: at-least-once delivery with
//!   acknowledge-after-completion and redelivery of stale messages
//! - **Result tracking**: `PENDING → STARTED → SUCCESS | FAILURE` status
//!   records with a retention window
//! - **Explicit task registry**: no global state, unknown names fail the
//!   task instead of the worker
//! - **Periodic scheduling**: a single-owner beat that submits tasks on a period
//! - **Backends**: in-memory for tests, Redis Streams for production
//!   (`redis` feature)
//!
//! # Quick Start
//!
//! ```ignore
//! use angelos::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[task(name = "tasks.echo")]
//! async fn echo(args: serde_json::Value) -> Result<serde_json::Value, String> {
//!     Ok(args)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(InMemoryBroker::new());
//!
//!     let mut registry = Registry::new();
//!     registry.register_task(echo)?;
//!     let worker = Worker::from_broker(broker.clone(), Arc::new(registry), "worker-1").start();
//!
//!     let dispatcher = Dispatcher::from_broker(broker);
//!     let task_id = dispatcher.send::<echo>(&serde_json::json!({"x": 1})).await?;
//!     let record = dispatcher
//!         .wait(&task_id, Duration::from_millis(100), Duration::from_secs(5))
//!         .await?;
//!
//!     println!("{}: {:?}", record.state, record.result);
//!     worker.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: Domain types shared by producers and workers
//! - [`storage`]: Message channel and result store contracts and backends
//! - [`executor`]: Registry, dispatcher, workers and beat
//! - [`config`]: TOML and environment configuration

// Allow the task macro to reference ::angelos from within this crate
extern crate self as angelos;

pub mod config;
pub mod core;
pub mod executor;
pub mod storage;

pub use config::{Config, ConfigError};

pub use core::{
    BoxError, CoreError, NoArgs, Result as CoreResult, Task, TaskId, TaskInvocation, TaskState,
    TaskStatusRecord,
};

pub use executor::{
    Beat, BeatHandle, DispatchError, Dispatcher, ExecutionError, HealthReport, Registry,
    RegistryError, ScheduleEntry, TaskDefinition, Worker, WorkerHandle, WorkerPool,
    WorkerPoolHandle,
};

pub use storage::{
    Delivery, InMemoryBroker, MessageChannel, Result as StorageResult, ResultStore, StorageError,
};

#[cfg(feature = "redis")]
pub use storage::RedisBroker;

// Re-export proc-macros
pub use angelos_macros::task;

// Re-export dependencies used in public API
pub use serde;
pub use serde_json;
pub use tokio;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```ignore
/// use angelos::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{
        BoxError, NoArgs, Task, TaskId, TaskInvocation, TaskState, TaskStatusRecord,
    };

    pub use crate::executor::{
        Beat, DispatchError, Dispatcher, ExecutionError, Registry, RegistryError, ScheduleEntry,
        Worker, WorkerHandle, WorkerPool,
    };

    pub use crate::storage::{InMemoryBroker, MessageChannel, ResultStore, StorageError};

    #[cfg(feature = "redis")]
    pub use crate::storage::RedisBroker;

    pub use crate::config::Config;

    pub use angelos_macros::task;

    pub use serde::{Deserialize, Serialize};
}
