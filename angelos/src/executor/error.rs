use crate::core::{CoreError, TaskId};
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Why a single task execution ended in `FAILURE`.
///
/// These are captured per task at the worker boundary and written to the
/// status record as the error description. They never stop the worker loop.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ExecutionError {
    /// No handler is registered under the invocation's task name.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// The arguments could not be decoded into the handler's input type.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The handler returned an error.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The handler ran longer than the worker's task timeout.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The worker executing the task disappeared before finishing it, and
    /// the task is not safe to run twice.
    #[error("worker lost while executing task (delivery {delivery_count})")]
    WorkerLost { delivery_count: u32 },
}

impl From<String> for ExecutionError {
    fn from(s: String) -> Self {
        ExecutionError::Failed(s)
    }
}

/// Registry misuse, surfaced at startup or as a lookup failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("task name already registered: {0}")]
    DuplicateName(String),

    #[error("no task registered under name: {0}")]
    NotFound(String),
}

/// Errors returned to callers of the [`Dispatcher`](super::Dispatcher).
///
/// Infrastructure errors are returned as-is; the dispatcher never retries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The invocation could not be durably enqueued.
    #[error("message channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The result store could not be read or written.
    #[error("result store unavailable: {0}")]
    StoreUnavailable(String),

    /// Arguments could not be converted to JSON.
    #[error("serialization error: {0}")]
    Serialization(#[source] CoreError),

    /// No status record exists for this id (unknown or expired).
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// A caller-chosen id collides with an existing record.
    #[error("task id already in use: {0}")]
    DuplicateId(TaskId),

    /// `wait` gave up before the task reached a terminal state.
    #[error("timed out waiting for task {0}")]
    Timeout(TaskId),
}

impl DispatchError {
    /// Maps an error from a result store call.
    pub(crate) fn from_store(e: StorageError) -> Self {
        match e {
            StorageError::Core(e) => DispatchError::Serialization(e),
            StorageError::ChannelUnavailable(msg) => DispatchError::ChannelUnavailable(msg),
            other => DispatchError::StoreUnavailable(other.to_string()),
        }
    }

    /// Maps an error from a message channel call.
    pub(crate) fn from_channel(e: StorageError) -> Self {
        match e {
            StorageError::Core(e) => DispatchError::Serialization(e),
            StorageError::StoreUnavailable(msg) => DispatchError::StoreUnavailable(msg),
            other => DispatchError::ChannelUnavailable(other.to_string()),
        }
    }
}

impl From<CoreError> for DispatchError {
    fn from(e: CoreError) -> Self {
        DispatchError::Serialization(e)
    }
}
