use super::error::{CoreError, Result};
use super::invocation::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Lifecycle state of a task.
///
/// States only move forward: `PENDING -> STARTED -> {SUCCESS | FAILURE}`.
/// `PENDING` may also jump straight to a terminal state (for example when
/// the task name is unknown to the worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Submitted and waiting in the channel.
    Pending,
    /// Picked up by a worker and executing.
    Started,
    /// Handler returned normally.
    Success,
    /// Handler failed, timed out, panicked, or could not be resolved.
    Failure,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        }
    }

    /// Position along the lifecycle. Both terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Started => 1,
            TaskState::Success | TaskState::Failure => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "STARTED" => Ok(TaskState::Started),
            "SUCCESS" => Ok(TaskState::Success),
            "FAILURE" => Ok(TaskState::Failure),
            _ => Err(CoreError::InvalidState(s.to_string())),
        }
    }
}

/// Status and outcome of one task, as kept by the result store.
///
/// Serializes as `{task_id, state, result, error, updated_at, worker}`;
/// `result` and `error` are `null` until the task reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: TaskId,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Worker that last touched the record, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl TaskStatusRecord {
    fn with_state(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            result: None,
            error: None,
            updated_at: Utc::now(),
            worker: None,
        }
    }

    pub fn pending(task_id: TaskId) -> Self {
        Self::with_state(task_id, TaskState::Pending)
    }

    pub fn started(task_id: TaskId, worker: impl Into<String>) -> Self {
        Self {
            worker: Some(worker.into()),
            ..Self::with_state(task_id, TaskState::Started)
        }
    }

    pub fn success(task_id: TaskId, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::with_state(task_id, TaskState::Success)
        }
    }

    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_state(task_id, TaskState::Failure)
        }
    }

    /// Stamps the record with the worker that produced it.
    pub fn by(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if writing `self` over `current` is allowed.
    ///
    /// Terminal records are never replaced. Otherwise a write must not move
    /// the state backwards, and between records of the same state the later
    /// `updated_at` wins.
    pub fn supersedes(&self, current: &TaskStatusRecord) -> bool {
        if current.is_terminal() {
            return false;
        }
        match self.state.rank().cmp(&current.state.rank()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.updated_at >= current.updated_at,
            std::cmp::Ordering::Less => false,
        }
    }
}
