//! Producer API: submits task invocations and reads back their status.
//!
//! Submission never waits for execution. It performs exactly two writes:
//! a `PENDING` status record, then the enqueue. The record goes first so
//! that every invocation a worker can see already has a discoverable status.

use super::error::DispatchError;
use crate::core::{to_json, Task, TaskId, TaskInvocation, TaskStatusRecord};
use crate::storage::{MessageChannel, ResultStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Connectivity of the two backends, as seen by [`Dispatcher::health`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub channel: std::result::Result<(), String>,
    pub store: std::result::Result<(), String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.channel.is_ok() && self.store.is_ok()
    }
}

/// Submits tasks for execution by workers.
///
/// The dispatcher needs no registry: task names are plain strings resolved
/// on the worker side at execution time.
///
/// # Example
///
/// ```no_run
/// use angelos::executor::Dispatcher;
/// use angelos::storage::InMemoryBroker;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = Arc::new(InMemoryBroker::new());
/// let dispatcher = Dispatcher::from_broker(broker);
///
/// let task_id = dispatcher.submit("echo", json!({"x": 1})).await?;
/// let record = dispatcher.query(&task_id).await?;
/// println!("{} is {}", task_id, record.state);
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher<C: ?Sized, S: ?Sized = C> {
    channel: Arc<C>,
    store: Arc<S>,
}

impl<C: ?Sized, S: ?Sized> Clone for Dispatcher<C, S> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            store: self.store.clone(),
        }
    }
}

impl<B> Dispatcher<B, B>
where
    B: MessageChannel + ResultStore + ?Sized,
{
    /// Creates a dispatcher over a backend that provides both the channel
    /// and the store.
    pub fn from_broker(broker: Arc<B>) -> Self {
        Self {
            channel: broker.clone(),
            store: broker,
        }
    }
}

impl<C, S> Dispatcher<C, S>
where
    C: MessageChannel + ?Sized,
    S: ResultStore + ?Sized,
{
    pub fn new(channel: Arc<C>, store: Arc<S>) -> Self {
        Self { channel, store }
    }

    /// Submits `task_name` with `args` under a fresh task id.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::StoreUnavailable`]: the `PENDING` record could not
    ///   be written; nothing was enqueued.
    /// - [`DispatchError::ChannelUnavailable`]: the enqueue failed; the
    ///   record has been marked `FAILURE`.
    pub async fn submit(&self, task_name: &str, args: Value) -> Result<TaskId> {
        self.submit_with_id(TaskId::new(), task_name, args).await
    }

    /// Submits under a caller-chosen id.
    ///
    /// Fails with [`DispatchError::DuplicateId`] if a record for `task_id`
    /// already exists; the existing task is left untouched.
    pub async fn submit_with_id(
        &self,
        task_id: TaskId,
        task_name: &str,
        args: Value,
    ) -> Result<TaskId> {
        let created = self
            .store
            .create_status(&TaskStatusRecord::pending(task_id.clone()))
            .await
            .map_err(DispatchError::from_store)?;
        if !created {
            return Err(DispatchError::DuplicateId(task_id));
        }

        let invocation = TaskInvocation::new(task_id.clone(), task_name, args);
        if let Err(e) = self.channel.enqueue(&invocation).await {
            error!("Failed to enqueue task {} ({}): {}", task_id, task_name, e);
            self.abandon(&task_id, &e.to_string()).await;
            return Err(DispatchError::from_channel(e));
        }

        info!("Submitted task {} ({})", task_id, task_name);
        Ok(task_id)
    }

    /// Submits a task declared with [`Task`] under [`Task::NAME`].
    pub async fn send<T: Task>(&self, args: &T::Args) -> Result<TaskId> {
        let args = to_json(args)?;
        self.submit(T::NAME, args).await
    }

    /// Reads the current status record.
    ///
    /// Returns [`DispatchError::NotFound`] if the id is unknown or its
    /// record has expired.
    pub async fn query(&self, task_id: &TaskId) -> Result<TaskStatusRecord> {
        self.store
            .get_status(task_id)
            .await
            .map_err(DispatchError::from_store)?
            .ok_or_else(|| DispatchError::NotFound(task_id.clone()))
    }

    /// Waits until the task reaches `SUCCESS` or `FAILURE`.
    ///
    /// Polls [`query`](Self::query) every `poll_interval`. When the store
    /// offers status notifications, a change wakes the wait early.
    pub async fn wait(
        &self,
        task_id: &TaskId,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<TaskStatusRecord> {
        let notify = self.store.status_notify().cloned();

        let poll = async {
            loop {
                // Registered before the read so a write in between is not missed.
                let notified = notify.as_ref().map(|n| n.notified());

                let record = self.query(task_id).await?;
                if record.is_terminal() {
                    return Ok::<_, DispatchError>(record);
                }

                match notified {
                    Some(notified) => {
                        tokio::select! {
                            _ = notified => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    None => tokio::time::sleep(poll_interval).await,
                }
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| DispatchError::Timeout(task_id.clone()))?
    }

    /// Pings the channel and the store.
    pub async fn health(&self) -> HealthReport {
        let (channel, store) = tokio::join!(self.channel.ping_channel(), self.store.ping_store());
        HealthReport {
            channel: channel.map_err(|e| e.to_string()),
            store: store.map_err(|e| e.to_string()),
        }
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Marks a task whose enqueue failed so it never sits in `PENDING`.
    async fn abandon(&self, task_id: &TaskId, reason: &str) {
        let record = TaskStatusRecord::failure(
            task_id.clone(),
            format!("message channel unavailable: {}", reason),
        );
        match self.store.put_status(&record).await {
            Ok(_) => debug!("Marked task {} as FAILURE after enqueue error", task_id),
            Err(e) => warn!(
                "Task {} left PENDING: enqueue failed and status update failed: {}",
                task_id, e
            ),
        }
    }
}
