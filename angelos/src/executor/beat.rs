//! Periodic task submission ("beat").
//!
//! The beat owns a fixed table of [`ScheduleEntry`] values and, on every
//! tick, submits each entry whose period has elapsed through a normal
//! [`Dispatcher`]. It never executes tasks itself.
//!
//! Exactly one beat may run per deployment: two instances would submit every
//! entry twice. Nothing here enforces that; it is an operational requirement.
//!
//! Missed periods are not replayed. After a pause (process down, slow tick)
//! an entry fires once and its next run is measured from that firing.

use super::dispatcher::Dispatcher;
use crate::core::TaskId;
use crate::storage::{MessageChannel, ResultStore};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// One periodic task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    /// Label used in logs.
    pub name: String,
    pub task_name: String,
    pub period: Duration,
    /// Arguments sent with every submission (`{}` unless set).
    pub args: Value,
    /// When this entry last fired successfully. `None` means it is due now.
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, task_name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            period,
            args: Value::Object(Default::default()),
            last_run_at: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Whether at least one period has elapsed since the last firing.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_run_at else {
            return true;
        };
        match TimeDelta::from_std(self.period) {
            Ok(period) => now.signed_duration_since(last) >= period,
            // A period too large to represent never comes due.
            Err(_) => false,
        }
    }

    /// When the entry comes due next, if it has fired before.
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        let period = TimeDelta::from_std(self.period).ok()?;
        self.last_run_at?.checked_add_signed(period)
    }
}

/// Clock-driven submitter of periodic tasks.
///
/// # Lifecycle
/// 1. Create: `Beat::new(dispatcher)`
/// 2. Configure: `.with_entry(entry)`, `.with_tick_interval(duration)`
/// 3. Start: `.start()` returns a handle
/// 4. Shutdown: `handle.shutdown().await`
///
/// # Example
/// ```no_run
/// use angelos::executor::{Beat, Dispatcher, ScheduleEntry};
/// use angelos::storage::InMemoryBroker;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() {
/// let dispatcher = Dispatcher::from_broker(Arc::new(InMemoryBroker::new()));
/// let beat = Beat::new(dispatcher)
///     .with_entry(ScheduleEntry::new(
///         "cleanup-every-minute",
///         "tasks.periodic_cleanup",
///         Duration::from_secs(60),
///     ))
///     .start();
///
/// // ... application runs ...
///
/// beat.shutdown().await;
/// # }
/// ```
pub struct Beat<C: ?Sized, S: ?Sized = C> {
    dispatcher: Dispatcher<C, S>,
    entries: Vec<ScheduleEntry>,
    tick_interval: Duration,
}

impl<C, S> Beat<C, S>
where
    C: MessageChannel + ?Sized + 'static,
    S: ResultStore + ?Sized + 'static,
{
    pub fn new(dispatcher: Dispatcher<C, S>) -> Self {
        Self {
            dispatcher,
            entries: Vec::new(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_entry(mut self, entry: ScheduleEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_entries(mut self, entries: impl IntoIterator<Item = ScheduleEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    /// Sets how often the schedule table is checked (default 1s).
    ///
    /// This bounds firing precision: an entry fires up to one tick interval
    /// after it comes due. Zero is raised to 1ms.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(MIN_TICK_INTERVAL);
        self
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Submits every entry that is due at `now` and returns the new task ids.
    ///
    /// A successful submission sets `last_run_at = now`. A failed one is
    /// logged and leaves the entry due, so the next tick tries again.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut submitted = Vec::new();

        for entry in self.entries.iter_mut().filter(|e| e.is_due(now)) {
            match self
                .dispatcher
                .submit(&entry.task_name, entry.args.clone())
                .await
            {
                Ok(task_id) => {
                    info!(
                        "Beat fired {} -> {} (task {})",
                        entry.name, entry.task_name, task_id
                    );
                    entry.last_run_at = Some(now);
                    submitted.push(task_id);
                }
                Err(e) => {
                    warn!(
                        "Beat failed to submit {} ({}), retrying next tick: {}",
                        entry.name, entry.task_name, e
                    );
                }
            }
        }

        submitted
    }

    /// Starts the beat loop in a background task.
    pub fn start(self) -> BeatHandle {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();

        let handle = tokio::spawn(async move {
            self.run(token).await;
        });

        BeatHandle {
            handle,
            cancellation_token,
        }
    }

    async fn run(mut self, token: CancellationToken) {
        info!(
            "Beat started with {} entries (tick_interval={:?})",
            self.entries.len(),
            self.tick_interval
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                _ = interval.tick() => {
                    let fired = self.tick(Utc::now()).await;
                    if !fired.is_empty() {
                        debug!("Beat tick submitted {} tasks", fired.len());
                    }
                }
            }
        }

        info!("Beat stopped");
    }
}

/// Handle for stopping a running [`Beat`].
pub struct BeatHandle {
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl BeatHandle {
    /// Stops the beat after its current tick.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.handle.await {
            error!("Beat terminated abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskStatusRecord;
    use crate::storage::{InMemoryBroker, StorageError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    /// Store whose writes can be switched off.
    #[derive(Default)]
    struct SwitchableStore {
        inner: InMemoryBroker,
        down: AtomicBool,
    }

    #[async_trait]
    impl ResultStore for SwitchableStore {
        async fn create_status(&self, record: &TaskStatusRecord) -> crate::storage::Result<bool> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StorageError::StoreUnavailable("maintenance".into()));
            }
            self.inner.create_status(record).await
        }

        async fn put_status(&self, record: &TaskStatusRecord) -> crate::storage::Result<bool> {
            self.inner.put_status(record).await
        }

        async fn get_status(
            &self,
            task_id: &TaskId,
        ) -> crate::storage::Result<Option<TaskStatusRecord>> {
            self.inner.get_status(task_id).await
        }

        async fn ping_store(&self) -> crate::storage::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_entry_due_rules() {
        let mut entry = ScheduleEntry::new("e", "tasks.cleanup", Duration::from_secs(10));
        assert!(entry.is_due(t(0)));
        assert_eq!(entry.next_run_at(), None);
        assert_eq!(entry.args, json!({}));

        entry.last_run_at = Some(t(0));
        assert!(!entry.is_due(t(9)));
        assert!(entry.is_due(t(10)));
        assert_eq!(entry.next_run_at(), Some(t(10)));
    }

    #[tokio::test]
    async fn test_tick_fires_due_entries_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut beat = Beat::new(Dispatcher::from_broker(broker.clone()))
            .with_entry(ScheduleEntry::new("a", "tasks.a", Duration::from_secs(10)))
            .with_entry(
                ScheduleEntry::new("b", "tasks.b", Duration::from_secs(60))
                    .with_args(json!({"region": "eu"})),
            );

        assert_eq!(beat.tick(t(0)).await.len(), 2);
        assert!(beat.tick(t(0)).await.is_empty());
        assert_eq!(beat.tick(t(10)).await.len(), 1);
        assert_eq!(broker.queued_len(), 3);
        assert_eq!(beat.entries()[0].last_run_at, Some(t(10)));
        assert_eq!(beat.entries()[1].last_run_at, Some(t(0)));
    }

    #[tokio::test]
    async fn test_submission_count_over_duration() {
        // Period P = 7s, observed for D = 100s with 1s ticks.
        let broker = Arc::new(InMemoryBroker::new());
        let mut beat = Beat::new(Dispatcher::from_broker(broker.clone()))
            .with_entry(ScheduleEntry::new("p", "tasks.p", Duration::from_secs(7)));

        let mut fired_at = Vec::new();
        for s in 0..=100 {
            if !beat.tick(t(s)).await.is_empty() {
                fired_at.push(s);
            }
        }

        let expected = 100 / 7;
        assert!((fired_at.len() as i64 - expected).abs() <= 1, "{:?}", fired_at);
        assert!(fired_at.windows(2).all(|w| w[1] - w[0] >= 7));
    }

    #[tokio::test]
    async fn test_missed_periods_are_not_replayed() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut beat = Beat::new(Dispatcher::from_broker(broker.clone()))
            .with_entry(ScheduleEntry::new("p", "tasks.p", Duration::from_secs(10)));

        beat.tick(t(0)).await;
        // Down for five periods.
        assert_eq!(beat.tick(t(55)).await.len(), 1);
        assert!(beat.tick(t(60)).await.is_empty());
        assert_eq!(beat.tick(t(65)).await.len(), 1);
        assert_eq!(broker.queued_len(), 3);
    }

    #[tokio::test]
    async fn test_failed_submission_retries_next_tick() {
        let channel = Arc::new(InMemoryBroker::new());
        let store = Arc::new(SwitchableStore::default());
        let mut beat = Beat::new(Dispatcher::new(channel.clone(), store.clone()))
            .with_entry(ScheduleEntry::new("p", "tasks.p", Duration::from_secs(10)));

        store.down.store(true, Ordering::SeqCst);
        assert!(beat.tick(t(0)).await.is_empty());
        assert_eq!(beat.entries()[0].last_run_at, None);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(beat.tick(t(1)).await.len(), 1);
        assert_eq!(beat.entries()[0].last_run_at, Some(t(1)));
        assert_eq!(channel.queued_len(), 1);
    }

    #[tokio::test]
    async fn test_started_beat_submits_and_stops() {
        let broker = Arc::new(InMemoryBroker::new());
        let handle = Beat::new(Dispatcher::from_broker(broker.clone()))
            .with_entry(ScheduleEntry::new("fast", "tasks.fast", Duration::from_millis(50)))
            .with_tick_interval(Duration::from_millis(10))
            .start();

        tokio::time::sleep(Duration::from_millis(230)).await;
        assert!(handle.is_running());
        handle.shutdown().await;

        let submitted = broker.queued_len();
        assert!((2..=7).contains(&submitted), "submitted {}", submitted);
    }

    #[tokio::test]
    async fn test_zero_tick_interval_is_raised() {
        let broker = Arc::new(InMemoryBroker::new());
        let beat = Beat::new(Dispatcher::from_broker(broker.clone()))
            .with_entry(ScheduleEntry::new("fast", "tasks.fast", Duration::from_millis(20)))
            .with_tick_interval(Duration::ZERO);
        assert_eq!(beat.tick_interval, MIN_TICK_INTERVAL);

        let handle = beat.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_running());
        handle.shutdown().await;

        assert!(broker.queued_len() >= 1);
    }
}
