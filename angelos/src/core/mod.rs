//! Core types and utilities for the angelos task dispatch engine.
//!
//! # Domain Model
//! - [`TaskId`]: Opaque identifier of one invocation
//! - [`TaskInvocation`]: A request to run a named handler with JSON arguments
//! - [`TaskState`] / [`TaskStatusRecord`]: The lifecycle record kept by the result store
//! - [`Task`]: Code-level task declaration shared by producers and workers
//!
//! # Serialization
//! Arguments and results travel as JSON trees ([`serde_json::Value`]).
//! - [`to_json`] / [`from_json`]: Convert typed values to and from trees
//! - [`serialize_value`] / [`deserialize_value`]: Convert values to and from bytes
//!
//! # Example
//!
//! ```
//! use angelos::core::{TaskId, TaskInvocation, TaskStatusRecord, TaskState};
//! use serde_json::json;
//!
//! let id = TaskId::new();
//! let invocation = TaskInvocation::new(id.clone(), "echo", json!({"x": 1}));
//! let record = TaskStatusRecord::pending(id);
//!
//! assert_eq!(invocation.task_name, "echo");
//! assert_eq!(record.state, TaskState::Pending);
//! ```

mod error;
mod invocation;
mod serialization;
mod status;
mod task;

pub use error::{CoreError, Error, Result};
pub use invocation::{TaskId, TaskInvocation};
pub use serialization::{deserialize_value, from_json, serialize_value, to_json};
pub use status::{TaskState, TaskStatusRecord};
pub use task::{BoxError, NoArgs, Task};
