use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a single task invocation.
///
/// Fresh ids are UUIDv4 strings, but any string a caller hands back is
/// accepted so lookups of foreign or mistyped ids resolve to "not found"
/// instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a new random task id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// One request to execute a named handler with the given arguments.
///
/// Created by the dispatcher and immutable once enqueued. The wire form is
/// `{task_id, task_name, args, enqueued_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub task_id: TaskId,
    pub task_name: String,
    pub args: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskInvocation {
    pub fn new(task_id: TaskId, task_name: impl Into<String>, args: Value) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            args,
            enqueued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_task_id_serializes_as_plain_string() {
        let id = TaskId::from("abc-123");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("abc-123"));
    }

    #[test]
    fn test_invocation_wire_format() {
        let inv = TaskInvocation::new(TaskId::from("t-1"), "echo", json!({"x": 1}));
        let value = serde_json::to_value(&inv).unwrap();

        assert_eq!(value["task_id"], "t-1");
        assert_eq!(value["task_name"], "echo");
        assert_eq!(value["args"], json!({"x": 1}));
        assert!(value["enqueued_at"].is_string());
    }
}
