//! Workers that pull task invocations from the message channel and run them.
//!
//! Each worker runs one loop: wait for a free execution slot, dequeue with a
//! timeout (so shutdown is noticed), resolve the task name in the
//! [`Registry`], record `STARTED`, run the handler, record `SUCCESS` or
//! `FAILURE`, and only then acknowledge the delivery.
//!
//! A handler error, panic or timeout is recorded on the task and never ends
//! the loop. Infrastructure errors are logged and the delivery is left
//! unacknowledged, so the channel redelivers it once the visibility timeout
//! has passed.

use super::error::ExecutionError;
use super::registry::{Registry, TaskDefinition};
use crate::core::{TaskState, TaskStatusRecord};
use crate::storage::{Delivery, MessageChannel, ResultStore};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);
const MIN_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Tracing Typestates
// ============================================================================

/// Typestate: Worker without structured tracing (uses basic log-style tracing only).
///
/// This is the default state. Basic `info!`, `debug!`, `warn!`, and `error!`
/// calls are still used, but no spans are created.
#[derive(Clone, Copy)]
pub struct WithoutStructuredTracing;

/// Typestate: Worker with structured tracing enabled.
///
/// Every task execution runs inside an `info` span carrying the worker id,
/// task id and task name, with the outcome recorded on the span.
#[derive(Clone, Copy)]
pub struct WithStructuredTracing;

/// Trait that defines tracing behavior based on type state.
pub trait TracingBehavior: Send + Sync + Clone + 'static {
    /// Creates a span for one task execution.
    fn task_execution_span(&self, worker_id: &str, delivery: &Delivery) -> Option<tracing::Span>;

    /// Creates a span for a stale-delivery recovery pass.
    fn recovery_span(&self, worker_id: &str) -> Option<tracing::Span>;
}

impl TracingBehavior for WithoutStructuredTracing {
    fn task_execution_span(&self, _worker_id: &str, _delivery: &Delivery) -> Option<tracing::Span> {
        None
    }

    fn recovery_span(&self, _worker_id: &str) -> Option<tracing::Span> {
        None
    }
}

impl TracingBehavior for WithStructuredTracing {
    fn task_execution_span(&self, worker_id: &str, delivery: &Delivery) -> Option<tracing::Span> {
        Some(tracing::info_span!(
            "task_execution",
            worker.id = worker_id,
            task.id = %delivery.invocation.task_id,
            task.name = %delivery.invocation.task_name,
            delivery = delivery.delivery_count,
            result = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        ))
    }

    fn recovery_span(&self, worker_id: &str) -> Option<tracing::Span> {
        Some(tracing::debug_span!(
            "stale_recovery",
            worker.id = worker_id,
            recovered = tracing::field::Empty,
        ))
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Executes task invocations from a [`MessageChannel`], writing status to a
/// [`ResultStore`].
///
/// # Example
///
/// ```no_run
/// use angelos::executor::{Registry, Worker};
/// use angelos::storage::InMemoryBroker;
/// use serde_json::Value;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = Registry::new();
/// registry.register("echo", |args: Value| async move { Ok::<_, String>(args) })?;
///
/// let broker = Arc::new(InMemoryBroker::new());
/// let handle = Worker::from_broker(broker, Arc::new(registry), "worker-1")
///     .with_concurrency(4)
///     .start();
///
/// // ... later
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Worker<C: ?Sized, S: ?Sized = C, Tr = WithoutStructuredTracing> {
    channel: Arc<C>,
    store: Arc<S>,
    registry: Arc<Registry>,
    worker_id: String,
    concurrency: usize,
    poll_timeout: Duration,
    task_timeout: Option<Duration>,
    visibility_timeout: Duration,
    recovery_interval: Duration,
    tracing_state: Tr,
}

impl<C: ?Sized, S: ?Sized, Tr: Clone> Clone for Worker<C, S, Tr> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            worker_id: self.worker_id.clone(),
            concurrency: self.concurrency,
            poll_timeout: self.poll_timeout,
            task_timeout: self.task_timeout,
            visibility_timeout: self.visibility_timeout,
            recovery_interval: self.recovery_interval,
            tracing_state: self.tracing_state.clone(),
        }
    }
}

impl<B> Worker<B, B, WithoutStructuredTracing>
where
    B: MessageChannel + ResultStore + ?Sized + 'static,
{
    /// Creates a worker over a backend that provides both the channel and
    /// the store.
    pub fn from_broker(broker: Arc<B>, registry: Arc<Registry>, worker_id: impl Into<String>) -> Self {
        Self::new(broker.clone(), broker, registry, worker_id)
    }
}

impl<C, S> Worker<C, S, WithoutStructuredTracing>
where
    C: MessageChannel + ?Sized + 'static,
    S: ResultStore + ?Sized + 'static,
{
    /// Creates a new worker.
    ///
    /// The registry is shared read-only; build it completely before
    /// starting any worker.
    pub fn new(
        channel: Arc<C>,
        store: Arc<S>,
        registry: Arc<Registry>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            store,
            registry,
            worker_id: worker_id.into(),
            concurrency: 1,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            task_timeout: None,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            tracing_state: WithoutStructuredTracing,
        }
    }

    /// Enables structured tracing with detailed spans.
    ///
    /// ```no_run
    /// # use angelos::executor::{Registry, Worker};
    /// # use angelos::storage::InMemoryBroker;
    /// # use std::sync::Arc;
    /// let broker = Arc::new(InMemoryBroker::new());
    /// let worker = Worker::from_broker(broker, Arc::new(Registry::new()), "worker-1")
    ///     .with_structured_tracing();
    /// ```
    pub fn with_structured_tracing(self) -> Worker<C, S, WithStructuredTracing> {
        Worker {
            channel: self.channel,
            store: self.store,
            registry: self.registry,
            worker_id: self.worker_id,
            concurrency: self.concurrency,
            poll_timeout: self.poll_timeout,
            task_timeout: self.task_timeout,
            visibility_timeout: self.visibility_timeout,
            recovery_interval: self.recovery_interval,
            tracing_state: WithStructuredTracing,
        }
    }
}

impl<C, S, Tr> Worker<C, S, Tr>
where
    C: MessageChannel + ?Sized + 'static,
    S: ResultStore + ?Sized + 'static,
    Tr: TracingBehavior,
{
    /// Sets how many handlers this worker runs at once (default 1).
    ///
    /// The worker only dequeues when it has a free slot, so it never holds
    /// messages it cannot start.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets how long a single dequeue blocks before the loop re-checks for
    /// shutdown (default 1s).
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Fails handlers that run longer than `timeout` with
    /// [`ExecutionError::TimedOut`].
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Sets how long a delivery may stay unacknowledged before it is
    /// handed out again (default 1h).
    ///
    /// Must exceed the longest expected handler run time, or long tasks are
    /// redelivered while still running.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets how often this worker scans for stale deliveries (default 60s).
    ///
    /// Zero is raised to 1ms.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Starts the worker in the background.
    ///
    /// Returns a [`WorkerHandle`] that can be used to control the worker.
    pub fn start(self) -> WorkerHandle {
        self.spawn(CancellationToken::new())
    }

    fn spawn(self, cancellation_token: CancellationToken) -> WorkerHandle {
        let worker_token = cancellation_token.clone();
        let worker_id_for_handle = self.worker_id.clone();

        info!(
            "Starting worker {} (concurrency {}, tasks: {:?})",
            self.worker_id,
            self.concurrency,
            self.registry.names()
        );

        let handle = tokio::spawn(async move {
            let slots = Arc::new(Semaphore::new(self.concurrency));
            let mut active_tasks: JoinSet<()> = JoinSet::new();

            let mut recovery_interval = tokio::time::interval(self.recovery_interval);
            recovery_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                while let Some(result) = active_tasks.try_join_next() {
                    if let Err(e) = result {
                        // Panics are caught inside `process`; this is a join failure.
                        error!("Worker {} task join failed: {}", self.worker_id, e);
                    }
                }

                // biased; shutdown and maintenance win over taking new work
                tokio::select! {
                    biased;

                    _ = worker_token.cancelled() => {
                        info!("Worker {} received shutdown signal", self.worker_id);
                        break;
                    }

                    _ = recovery_interval.tick() => {
                        self.recover_stale().await;
                    }

                    permit = slots.clone().acquire_owned() => {
                        let Ok(permit) = permit else {
                            error!("Worker {} semaphore closed unexpectedly", self.worker_id);
                            break;
                        };

                        let result = tokio::select! {
                            biased;
                            _ = worker_token.cancelled() => {
                                info!("Worker {} received shutdown signal", self.worker_id);
                                break;
                            }
                            result = self.channel.dequeue(&self.worker_id, self.poll_timeout) => result,
                        };

                        match result {
                            Ok(Some(delivery)) => {
                                let span = self
                                    .tracing_state
                                    .task_execution_span(&self.worker_id, &delivery);
                                let task = Self::process(
                                    self.channel.clone(),
                                    self.store.clone(),
                                    self.registry.clone(),
                                    self.worker_id.clone(),
                                    self.task_timeout,
                                    delivery,
                                );
                                let task = async move {
                                    // Slot is released when the task finishes
                                    let _permit = permit;
                                    task.await;
                                };

                                if let Some(span) = span {
                                    active_tasks.spawn(task.instrument(span));
                                } else {
                                    active_tasks.spawn(task);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!("Worker {} failed to dequeue: {}", self.worker_id, e);
                                tokio::select! {
                                    _ = worker_token.cancelled() => {}
                                    _ = tokio::time::sleep(self.poll_timeout) => {}
                                }
                            }
                        }
                    }
                }
            }

            let in_flight_count = active_tasks.len();
            if in_flight_count > 0 {
                info!(
                    "Worker {} waiting for {} in-flight tasks to complete",
                    self.worker_id, in_flight_count
                );
                while active_tasks.join_next().await.is_some() {}
                info!(
                    "Worker {} completed all {} in-flight tasks",
                    self.worker_id, in_flight_count
                );
            }

            info!("Worker {} stopped", self.worker_id);
        });

        WorkerHandle {
            worker_id: worker_id_for_handle,
            handle,
            cancellation_token,
        }
    }

    async fn recover_stale(&self) {
        let span = self.tracing_state.recovery_span(&self.worker_id);
        let recovery = async {
            match self.channel.recover_stale(self.visibility_timeout).await {
                Ok(count) if count > 0 => {
                    tracing::Span::current().record("recovered", count);
                    info!(
                        "Worker {} re-queued {} stale deliveries",
                        self.worker_id, count
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "Worker {} failed to recover stale deliveries: {}",
                    self.worker_id, e
                ),
            }
        };

        match span {
            Some(span) => recovery.instrument(span).await,
            None => recovery.await,
        }
    }

    /// Handles one delivery end to end. Never returns an error: every
    /// outcome is either recorded on the task or left for redelivery.
    async fn process(
        channel: Arc<C>,
        store: Arc<S>,
        registry: Arc<Registry>,
        worker_id: String,
        task_timeout: Option<Duration>,
        delivery: Delivery,
    ) {
        let task_id = delivery.invocation.task_id.clone();
        let task_name = delivery.invocation.task_name.as_str();

        let current = match store.get_status(&task_id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(
                    "Worker {} cannot read status of task {}, leaving it for redelivery: {}",
                    worker_id, task_id, e
                );
                return;
            }
        };

        if let Some(record) = current.as_ref().filter(|r| r.is_terminal()) {
            info!(
                "Worker {} skipping duplicate delivery of task {} (already {})",
                worker_id, task_id, record.state
            );
            Self::ack(&channel, &delivery, &worker_id).await;
            return;
        }

        let started = Instant::now();
        let outcome = match registry.resolve(task_name) {
            Err(_) => {
                warn!(
                    "Worker {} has no handler for task {} ({})",
                    worker_id, task_id, task_name
                );
                Err(ExecutionError::UnknownTask(task_name.to_string()))
            }
            Ok(def)
                if delivery.is_redelivery()
                    && !def.idempotent
                    && current.as_ref().map(|r| r.state) == Some(TaskState::Started) =>
            {
                warn!(
                    "Worker {} not re-running task {} ({}): previous worker was lost mid-execution",
                    worker_id, task_id, task_name
                );
                Err(ExecutionError::WorkerLost {
                    delivery_count: delivery.delivery_count,
                })
            }
            Ok(def) => {
                let started_record = TaskStatusRecord::started(task_id.clone(), worker_id.as_str());
                if let Err(e) = store.put_status(&started_record).await {
                    warn!(
                        "Worker {} cannot mark task {} as started, leaving it for redelivery: {}",
                        worker_id, task_id, e
                    );
                    return;
                }
                debug!("Worker {} started task {} ({})", worker_id, task_id, task_name);

                Self::execute(def, delivery.invocation.args.clone(), task_timeout).await
            }
        };

        let span = tracing::Span::current();
        span.record("duration_ms", started.elapsed().as_millis() as u64);

        let record = match outcome {
            Ok(value) => {
                span.record("result", "success");
                info!("Worker {} completed task {} ({})", worker_id, task_id, task_name);
                TaskStatusRecord::success(task_id.clone(), value)
            }
            Err(e) => {
                span.record("result", "failure");
                warn!(
                    "Worker {} task {} ({}) failed: {}",
                    worker_id, task_id, task_name, e
                );
                TaskStatusRecord::failure(task_id.clone(), e.to_string())
            }
        }
        .by(worker_id.as_str());

        match store.put_status(&record).await {
            Ok(true) => {}
            Ok(false) => debug!(
                "Worker {} result for task {} was not applied; record already terminal",
                worker_id, task_id
            ),
            Err(e) => {
                // Unacked: the delivery comes back after the visibility timeout.
                error!(
                    "Worker {} failed to record outcome of task {}: {}",
                    worker_id, task_id, e
                );
                return;
            }
        }

        Self::ack(&channel, &delivery, &worker_id).await;
    }

    async fn execute(
        def: &TaskDefinition,
        args: Value,
        task_timeout: Option<Duration>,
    ) -> Result<Value, ExecutionError> {
        let run = AssertUnwindSafe(def.call(args)).catch_unwind();

        let result = match task_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => return Err(ExecutionError::TimedOut(limit)),
            },
            None => run.await,
        };

        result.unwrap_or_else(|panic| Err(ExecutionError::Panicked(panic_message(panic.as_ref()))))
    }

    async fn ack(channel: &Arc<C>, delivery: &Delivery, worker_id: &str) {
        if let Err(e) = channel.ack(delivery).await {
            warn!(
                "Worker {} failed to acknowledge task {}: {}",
                worker_id, delivery.invocation.task_id, e
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handle for controlling a running worker.
///
/// Uses `CancellationToken` for hierarchical cancellation support.
pub struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl WorkerHandle {
    /// Returns the worker ID.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns a reference to the cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Requests the worker to shut down gracefully.
    ///
    /// The worker stops dequeuing and waits for its in-flight tasks before
    /// this returns.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.handle.await {
            error!("Worker {} terminated abnormally: {}", self.worker_id, e);
        }
    }

    /// Returns true if the worker task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the worker immediately without waiting for completion.
    ///
    /// In-flight tasks stay unacknowledged and are redelivered after the
    /// visibility timeout. Prefer `shutdown()` for normal termination.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Runs several identically configured workers in one process.
///
/// The template worker's id is used as a prefix: workers are named
/// `{prefix}-0`, `{prefix}-1`, and so on. All of them share the same
/// registry and backends.
///
/// ```no_run
/// # use angelos::executor::{Registry, Worker, WorkerPool};
/// # use angelos::storage::InMemoryBroker;
/// # use std::sync::Arc;
/// # async fn example() {
/// let broker = Arc::new(InMemoryBroker::new());
/// let template = Worker::from_broker(broker, Arc::new(Registry::new()), "worker");
/// let pool = WorkerPool::new(template).with_size(4).start();
/// pool.shutdown().await;
/// # }
/// ```
pub struct WorkerPool<C: ?Sized, S: ?Sized = C, Tr = WithoutStructuredTracing> {
    template: Worker<C, S, Tr>,
    size: usize,
}

impl<C, S, Tr> WorkerPool<C, S, Tr>
where
    C: MessageChannel + ?Sized + 'static,
    S: ResultStore + ?Sized + 'static,
    Tr: TracingBehavior,
{
    pub fn new(template: Worker<C, S, Tr>) -> Self {
        Self { template, size: 1 }
    }

    /// Sets the number of workers (default 1).
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn start(self) -> WorkerPoolHandle {
        let cancellation_token = CancellationToken::new();
        let prefix = self.template.worker_id.clone();

        let workers = (0..self.size)
            .map(|i| {
                let mut worker = self.template.clone();
                worker.worker_id = format!("{}-{}", prefix, i);
                worker.spawn(cancellation_token.child_token())
            })
            .collect();

        info!("Started worker pool {} with {} workers", prefix, self.size);

        WorkerPoolHandle {
            workers,
            cancellation_token,
        }
    }
}

/// Handle for a running [`WorkerPool`].
pub struct WorkerPoolHandle {
    workers: Vec<WorkerHandle>,
    cancellation_token: CancellationToken,
}

impl WorkerPoolHandle {
    pub fn worker_ids(&self) -> Vec<&str> {
        self.workers.iter().map(WorkerHandle::worker_id).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Token shared by every worker in the pool; cancelling it stops them all.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Stops every worker and waits for their in-flight tasks.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        for worker in self.workers {
            worker.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TaskId, TaskInvocation};
    use crate::executor::Dispatcher;
    use crate::storage::InMemoryBroker;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);
    const POLL: Duration = Duration::from_millis(5);

    fn broker() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::new())
    }

    fn worker(broker: &Arc<InMemoryBroker>, registry: Registry) -> Worker<InMemoryBroker> {
        Worker::from_broker(broker.clone(), Arc::new(registry), "test-worker")
            .with_poll_timeout(Duration::from_millis(20))
    }

    async fn wait_for(broker: &Arc<InMemoryBroker>, task_id: &TaskId) -> TaskStatusRecord {
        Dispatcher::from_broker(broker.clone())
            .wait(task_id, POLL, WAIT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_executes_and_records_success() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("echo", |args: Value| async move { Ok::<_, String>(args) })
            .unwrap();

        let handle = worker(&broker, registry).start();
        let task_id = Dispatcher::from_broker(broker.clone())
            .submit("echo", json!({"x": 1}))
            .await
            .unwrap();

        let record = wait_for(&broker, &task_id).await;
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.result, Some(json!({"x": 1})));
        assert_eq!(record.worker.as_deref(), Some("test-worker"));

        handle.shutdown().await;
        assert_eq!(broker.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_task_fails_and_loop_continues() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("echo", |args: Value| async move { Ok::<_, String>(args) })
            .unwrap();

        let handle = worker(&broker, registry).start();
        let dispatcher = Dispatcher::from_broker(broker.clone());

        let unknown = dispatcher.submit("unregistered_task", json!({})).await.unwrap();
        let known = dispatcher.submit("echo", json!("after")).await.unwrap();

        let record = wait_for(&broker, &unknown).await;
        assert_eq!(record.state, TaskState::Failure);
        assert!(record.error.unwrap().contains("unregistered_task"));
        assert_eq!(record.result, None);

        let record = wait_for(&broker, &known).await;
        assert_eq!(record.state, TaskState::Success);
        assert!(handle.is_running());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_error_recorded_as_failure() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("explode", |_: Value| async move {
                Err::<Value, _>("disk full".to_string())
            })
            .unwrap();

        let handle = worker(&broker, registry).start();
        let task_id = Dispatcher::from_broker(broker.clone())
            .submit("explode", json!({}))
            .await
            .unwrap();

        let record = wait_for(&broker, &task_id).await;
        assert_eq!(record.state, TaskState::Failure);
        assert_eq!(record.error.as_deref(), Some("disk full"));
        assert_eq!(record.result, None);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("panics", |_: Value| async move {
                if true {
                    panic!("handler bug");
                }
                Ok::<Value, String>(json!(null))
            })
            .unwrap();
        registry
            .register("echo", |args: Value| async move { Ok::<_, String>(args) })
            .unwrap();

        let handle = worker(&broker, registry).start();
        let dispatcher = Dispatcher::from_broker(broker.clone());
        let bad = dispatcher.submit("panics", json!({})).await.unwrap();
        let good = dispatcher.submit("echo", json!(1)).await.unwrap();

        let record = wait_for(&broker, &bad).await;
        assert_eq!(record.state, TaskState::Failure);
        assert!(record.error.unwrap().contains("handler bug"));
        assert_eq!(wait_for(&broker, &good).await.state, TaskState::Success);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("slow", |_: Value| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, String>(json!("late"))
            })
            .unwrap();

        let handle = worker(&broker, registry)
            .with_task_timeout(Duration::from_millis(50))
            .start();
        let task_id = Dispatcher::from_broker(broker.clone())
            .submit("slow", json!({}))
            .await
            .unwrap();

        let record = wait_for(&broker, &task_id).await;
        assert_eq!(record.state, TaskState::Failure);
        assert!(record.error.unwrap().contains("timed out"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_not_rerun() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        {
            let calls = calls.clone();
            registry
                .register("count", move |_: Value| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(json!("counted"))
                    }
                })
                .unwrap();
        }

        // A finished task whose message shows up again.
        let task_id = TaskId::from("already-done");
        broker
            .put_status(&TaskStatusRecord::success(task_id.clone(), json!("first run")))
            .await
            .unwrap();
        broker
            .enqueue(&TaskInvocation::new(task_id.clone(), "count", json!({})))
            .await
            .unwrap();

        let handle = worker(&broker, registry).start();
        let deadline = tokio::time::Instant::now() + WAIT;
        while broker.queued_len() > 0 || broker.in_flight_len() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "delivery never acked");
            tokio::time::sleep(POLL).await;
        }
        handle.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let record = broker.get_status(&task_id).await.unwrap().unwrap();
        assert_eq!(record.result, Some(json!("first run")));
    }

    /// Leaves `task_id` STARTED with a second delivery queued, as if the
    /// first worker died mid-execution.
    async fn simulate_lost_worker(broker: &Arc<InMemoryBroker>, task_id: &TaskId, name: &str) {
        Dispatcher::from_broker(broker.clone())
            .submit_with_id(task_id.clone(), name, json!({}))
            .await
            .unwrap();
        let first = broker
            .dequeue("crashed-worker", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker
            .put_status(&TaskStatusRecord::started(task_id.clone(), "crashed-worker"))
            .await
            .unwrap();
        assert_eq!(broker.recover_stale(Duration::ZERO).await.unwrap(), 1);
        assert!(broker.ack(&first).await.is_err());
    }

    #[tokio::test]
    async fn test_lost_worker_non_idempotent_task_fails() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("charge_card", |_: Value| async move { Ok::<_, String>(json!("charged")) })
            .unwrap();

        let task_id = TaskId::from("charge-1");
        simulate_lost_worker(&broker, &task_id, "charge_card").await;

        let handle = worker(&broker, registry).start();
        let record = wait_for(&broker, &task_id).await;
        assert_eq!(record.state, TaskState::Failure);
        assert!(record.error.unwrap().contains("worker lost"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_worker_idempotent_task_reruns() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("refresh_cache", |_: Value| async move { Ok::<_, String>(json!("fresh")) })
            .unwrap();
        registry.set_idempotent("refresh_cache", true).unwrap();

        let task_id = TaskId::from("refresh-1");
        simulate_lost_worker(&broker, &task_id, "refresh_cache").await;

        let handle = worker(&broker, registry).start();
        let record = wait_for(&broker, &task_id).await;
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.result, Some(json!("fresh")));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let broker = broker();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        {
            let (running, peak) = (running.clone(), peak.clone());
            registry
                .register("work", move |_: Value| {
                    let (running, peak) = (running.clone(), peak.clone());
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(json!(null))
                    }
                })
                .unwrap();
        }

        let dispatcher = Dispatcher::from_broker(broker.clone());
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(dispatcher.submit("work", json!({})).await.unwrap());
        }

        let handle = worker(&broker, registry).with_concurrency(2).start();
        for id in &ids {
            assert_eq!(wait_for(&broker, id).await.state, TaskState::Success);
        }
        handle.shutdown().await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_task() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("slow", |_: Value| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>(json!("finished"))
            })
            .unwrap();

        let handle = worker(&broker, registry).start();
        let task_id = Dispatcher::from_broker(broker.clone())
            .submit("slow", json!({}))
            .await
            .unwrap();

        // Wait until it is running, then ask to stop.
        let dispatcher = Dispatcher::from_broker(broker.clone());
        while dispatcher.query(&task_id).await.unwrap().state != TaskState::Started {
            tokio::time::sleep(POLL).await;
        }
        handle.shutdown().await;

        let record = dispatcher.query(&task_id).await.unwrap();
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(broker.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_zero_recovery_interval_is_raised() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("echo", |args: Value| async move { Ok::<_, String>(args) })
            .unwrap();

        let w = worker(&broker, registry).with_recovery_interval(Duration::ZERO);
        assert_eq!(w.recovery_interval, MIN_INTERVAL);

        let handle = w.start();
        let task_id = Dispatcher::from_broker(broker.clone())
            .submit("echo", json!("ok"))
            .await
            .unwrap();

        let record = wait_for(&broker, &task_id).await;
        assert_eq!(record.state, TaskState::Success);
        assert!(handle.is_running());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_names_workers_and_drains_queue() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("echo", |args: Value| async move { Ok::<_, String>(args) })
            .unwrap();

        let template = Worker::from_broker(broker.clone(), Arc::new(registry), "pool")
            .with_poll_timeout(Duration::from_millis(20));
        let pool = WorkerPool::new(template).with_size(3).start();
        assert_eq!(pool.worker_ids(), vec!["pool-0", "pool-1", "pool-2"]);

        let dispatcher = Dispatcher::from_broker(broker.clone());
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(dispatcher.submit("echo", json!(i)).await.unwrap());
        }
        for (i, id) in ids.iter().enumerate() {
            let record = wait_for(&broker, id).await;
            assert_eq!(record.result, Some(json!(i)));
            assert!(record.worker.unwrap().starts_with("pool-"));
        }

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_structured_tracing_worker_runs_tasks() {
        let broker = broker();
        let mut registry = Registry::new();
        registry
            .register("echo", |args: Value| async move { Ok::<_, String>(args) })
            .unwrap();

        let handle = worker(&broker, registry).with_structured_tracing().start();
        let task_id = Dispatcher::from_broker(broker.clone())
            .submit("echo", json!("traced"))
            .await
            .unwrap();

        assert_eq!(wait_for(&broker, &task_id).await.state, TaskState::Success);
        handle.shutdown().await;
    }
}
