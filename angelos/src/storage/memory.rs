use super::{
    error::Result, error::StorageError, Delivery, MessageChannel, ResultStore, DEFAULT_RESULT_TTL,
};
use crate::core::{TaskId, TaskInvocation, TaskStatusRecord};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

/// A queued message together with how often it has been handed out.
struct Envelope {
    invocation: TaskInvocation,
    delivery_count: u32,
}

/// A message handed to a consumer and not yet acknowledged.
struct InFlight {
    envelope: Envelope,
    delivered_at: Instant,
}

struct StoredRecord {
    record: TaskStatusRecord,
    expires_at: Instant,
}

impl StoredRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory message channel and result store.
///
/// The channel is an unbounded mpsc queue (mimics a Redis Stream) with a
/// DashMap of in-flight deliveries standing in for the pending entries
/// list. The store is a DashMap of records with per-record expiry.
///
/// Only suitable for a single process: nothing here survives a restart and
/// the queue is not shared across processes.
pub struct InMemoryBroker {
    pending_tx: mpsc::UnboundedSender<Envelope>,
    pending_rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    queued: AtomicUsize,
    in_flight: DashMap<String, InFlight>,
    next_receipt: AtomicU64,
    records: DashMap<TaskId, StoredRecord>,
    result_ttl: Duration,
    /// Woken when any status record changes
    status_notify: Arc<Notify>,
}

impl InMemoryBroker {
    /// Creates a broker with the default 24 hour result retention.
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            pending_tx,
            pending_rx: Arc::new(Mutex::new(pending_rx)),
            queued: AtomicUsize::new(0),
            in_flight: DashMap::new(),
            next_receipt: AtomicU64::new(1),
            records: DashMap::new(),
            result_ttl: DEFAULT_RESULT_TTL,
            status_notify: Arc::new(Notify::new()),
        }
    }

    /// Sets how long status records are retained after their last write.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Number of messages waiting to be dequeued.
    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Number of messages delivered but not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Evicts expired status records. Returns how many were removed.
    ///
    /// Runs on every [`MessageChannel::recover_stale`] pass as well.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, stored| !stored.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!("Purged {} expired status records", removed);
        }
        removed
    }

    fn push(&self, envelope: Envelope) -> Result<()> {
        // Count before sending so a racing dequeue never decrements below zero.
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.pending_tx.send(envelope).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::ChannelUnavailable(
                "pending queue closed".to_string(),
            ));
        }
        Ok(())
    }

    fn store(&self, record: &TaskStatusRecord) -> StoredRecord {
        StoredRecord {
            record: record.clone(),
            expires_at: Instant::now() + self.result_ttl,
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageChannel for InMemoryBroker {
    async fn enqueue(&self, invocation: &TaskInvocation) -> Result<()> {
        self.push(Envelope {
            invocation: invocation.clone(),
            delivery_count: 1,
        })
    }

    async fn dequeue(&self, consumer: &str, timeout: Duration) -> Result<Option<Delivery>> {
        // Waiting for the receiver lock counts against the timeout too; other
        // consumers may hold it while they wait.
        let received = tokio::time::timeout(timeout, async {
            let mut rx = self.pending_rx.lock().await;
            rx.recv().await
        })
        .await;

        let envelope = match received {
            Ok(Some(envelope)) => envelope,
            // The sender lives in `self`, so a closed channel means nothing is coming.
            Ok(None) | Err(_) => return Ok(None),
        };

        let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst).to_string();
        let delivery = Delivery {
            invocation: envelope.invocation.clone(),
            receipt: receipt.clone(),
            consumer: consumer.to_string(),
            delivery_count: envelope.delivery_count,
        };

        // In flight before it leaves the queue count, so it is always visible in one.
        self.in_flight.insert(
            receipt,
            InFlight {
                envelope,
                delivered_at: Instant::now(),
            },
        );
        self.queued.fetch_sub(1, Ordering::SeqCst);

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.in_flight
            .remove(&delivery.receipt)
            .map(|_| ())
            .ok_or_else(|| StorageError::UnknownDelivery(delivery.receipt.clone()))
    }

    async fn recover_stale(&self, idle: Duration) -> Result<u64> {
        // Also the eviction pass for expired status records.
        self.purge_expired();

        let now = Instant::now();
        let stale: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| now.duration_since(entry.delivered_at) >= idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut recovered = 0u64;
        for receipt in stale {
            // An ack may have raced us; only requeue what we actually removed.
            if let Some((_, in_flight)) = self.in_flight.remove(&receipt) {
                let mut envelope = in_flight.envelope;
                envelope.delivery_count += 1;
                debug!(
                    "Redelivering stale task {} (delivery {})",
                    envelope.invocation.task_id, envelope.delivery_count
                );
                self.push(envelope)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn ping_channel(&self) -> Result<()> {
        if self.pending_tx.is_closed() {
            return Err(StorageError::ChannelUnavailable(
                "pending queue closed".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for InMemoryBroker {
    async fn create_status(&self, record: &TaskStatusRecord) -> Result<bool> {
        let now = Instant::now();
        let created = match self.records.entry(record.task_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    entry.insert(self.store(record));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(self.store(record));
                true
            }
        };
        if created {
            self.status_notify.notify_waiters();
        }
        Ok(created)
    }

    async fn put_status(&self, record: &TaskStatusRecord) -> Result<bool> {
        let now = Instant::now();
        let applied = match self.records.entry(record.task_id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.is_expired(now) || record.supersedes(&current.record) {
                    entry.insert(self.store(record));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(self.store(record));
                true
            }
        };

        if applied {
            self.status_notify.notify_waiters();
        } else {
            debug!(
                "Rejected {} write for task {}: record already further along",
                record.state, record.task_id
            );
        }
        Ok(applied)
    }

    async fn get_status(&self, task_id: &TaskId) -> Result<Option<TaskStatusRecord>> {
        let now = Instant::now();
        let found = self.records.get(task_id).map(|stored| {
            if stored.is_expired(now) {
                None
            } else {
                Some(stored.record.clone())
            }
        });

        match found {
            Some(Some(record)) => Ok(Some(record)),
            Some(None) => {
                self.records.remove_if(task_id, |_, stored| stored.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn ping_store(&self) -> Result<()> {
        Ok(())
    }

    fn status_notify(&self) -> Option<&Arc<Notify>> {
        Some(&self.status_notify)
    }
}
