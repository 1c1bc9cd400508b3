//! Task registry: the explicit mapping from task name to handler.
//!
//! A [`Registry`] is built once at worker startup, then frozen behind an
//! `Arc` and handed to every worker. There is no process-wide table;
//! two registries in the same process are independent.

use super::error::{ExecutionError, RegistryError};
use crate::core::{from_json, to_json, BoxError, Task};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Type-erased task handler: JSON arguments in, JSON result out.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ExecutionError>> + Send + Sync>;

/// A registered task.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    /// Whether a redelivered invocation may be run again after its worker
    /// was lost mid-execution.
    pub idempotent: bool,
    pub handler: Handler,
}

impl TaskDefinition {
    /// Runs the handler on `args`.
    pub fn call(&self, args: Value) -> BoxFuture<'static, Result<Value, ExecutionError>> {
        (self.handler)(args)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("idempotent", &self.idempotent)
            .finish_non_exhaustive()
    }
}

/// Registry of task handlers keyed by name.
///
/// # Example
///
/// ```
/// use angelos::executor::Registry;
/// use serde_json::Value;
///
/// let mut registry = Registry::new();
/// registry
///     .register("echo", |args: Value| async move { Ok::<_, String>(args) })
///     .unwrap();
///
/// assert!(registry.contains("echo"));
/// assert!(registry.resolve("missing").is_err());
/// ```
#[derive(Default)]
pub struct Registry {
    tasks: HashMap<String, TaskDefinition>,
}

impl Registry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Registers a handler taking typed arguments.
    ///
    /// The JSON arguments of each invocation are decoded into `A`; a decode
    /// failure is reported as [`ExecutionError::InvalidArguments`] without
    /// calling the handler. The handler's output is encoded back to JSON.
    pub fn register<A, F, Fut, R, E>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: Handler = Arc::new(move |args: Value| {
            let handler = handler.clone();
            async move {
                let args: A = from_json(args)
                    .map_err(|e| ExecutionError::InvalidArguments(e.to_string()))?;
                let output = handler(args).await.map_err(failed)?;
                encode_output(&output)
            }
            .boxed()
        });

        self.insert(name.into(), false, boxed)
    }

    /// Registers a handler that works on the raw JSON arguments.
    pub fn register_raw<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |args: Value| handler(args).boxed());
        self.insert(name.into(), false, boxed)
    }

    /// Registers a task declared with [`Task`] (usually via `#[task]`)
    /// under [`Task::NAME`], carrying over [`Task::IDEMPOTENT`].
    pub fn register_task<T: Task>(&mut self, task: T) -> Result<(), RegistryError> {
        let task = Arc::new(task);
        let boxed: Handler = Arc::new(move |args: Value| {
            let task = task.clone();
            async move {
                let args: T::Args = from_json(args)
                    .map_err(|e| ExecutionError::InvalidArguments(e.to_string()))?;
                let output = task.run(args).await.map_err(failed)?;
                encode_output(&output)
            }
            .boxed()
        });

        self.insert(T::NAME.to_string(), T::IDEMPOTENT, boxed)
    }

    /// Marks an already registered task as safe (or unsafe) to re-run.
    pub fn set_idempotent(&mut self, name: &str, idempotent: bool) -> Result<(), RegistryError> {
        let def = self
            .tasks
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        def.idempotent = idempotent;
        Ok(())
    }

    /// Looks up a task by name.
    pub fn resolve(&self, name: &str) -> Result<&TaskDefinition, RegistryError> {
        self.tasks
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn insert(&mut self, name: String, idempotent: bool, handler: Handler) -> Result<(), RegistryError> {
        if self.tasks.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        debug!("Registered task: {}", name);
        self.tasks.insert(
            name.clone(),
            TaskDefinition {
                name,
                idempotent,
                handler,
            },
        );
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.names())
            .finish()
    }
}

fn failed<E: Into<BoxError>>(e: E) -> ExecutionError {
    let boxed: BoxError = e.into();
    ExecutionError::Failed(boxed.to_string())
}

fn encode_output<R: Serialize>(output: &R) -> Result<Value, ExecutionError> {
    to_json(output).map_err(|e| ExecutionError::Failed(format!("failed to encode result: {}", e)))
}
