//! Execution layer: registering tasks, submitting them, running them.
//!
//! - [`Registry`]: task name to handler, built once per worker process
//! - [`Dispatcher`]: producer API (`submit`, `query`, `wait`)
//! - [`Worker`] / [`WorkerPool`]: consume invocations and record outcomes
//! - [`Beat`]: submits [`ScheduleEntry`] tasks on a fixed period
//!
//! Producers and workers are decoupled: a dispatcher never consults a
//! registry, and task names are resolved only when a worker picks up the
//! invocation.

mod beat;
mod dispatcher;
mod error;
mod registry;
mod worker;

pub use beat::{Beat, BeatHandle, ScheduleEntry};
pub use dispatcher::{Dispatcher, HealthReport};
pub use error::{DispatchError, ExecutionError, RegistryError};
pub use registry::{Handler, Registry, TaskDefinition};
pub use worker::{
    TracingBehavior, WithStructuredTracing, WithoutStructuredTracing, Worker, WorkerHandle,
    WorkerPool, WorkerPoolHandle,
};
