//! Storage layer for the angelos task dispatch engine.
//!
//! Two narrow contracts sit between producers and workers:
//!
//! - [`MessageChannel`]: a durable, at-least-once queue of task invocations
//! - [`ResultStore`]: a key-value store of task status records with expiry
//!
//! Backends implement both on one connection:
//!
//! - [`InMemoryBroker`]: single-process backend for tests and embedded use
//! - [`RedisBroker`]: Redis Streams + hashes, for workers on other machines
//!
//! # Example
//!
//! ```no_run
//! use angelos::storage::{InMemoryBroker, ResultStore};
//! use angelos::core::TaskId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! assert!(broker.get_status(&TaskId::from("missing")).await?.is_none());
//! # Ok(())
//! # }
//! ```

use crate::core::{TaskId, TaskInvocation, TaskStatusRecord};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

mod error;
mod queue;

#[cfg(feature = "redis")]
pub mod redis;

pub mod memory;

pub use error::{Result, StorageError};
pub use memory::InMemoryBroker;
pub use queue::Delivery;

#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Default retention for status records (24 hours).
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Queue of task invocations shared by producers and workers.
///
/// Delivery is at-least-once: a message handed out by [`dequeue`] stays in
/// flight until [`ack`]ed, and [`recover_stale`] puts messages that were
/// never acked back on the queue. FIFO order is best-effort only.
///
/// [`dequeue`]: MessageChannel::dequeue
/// [`ack`]: MessageChannel::ack
/// [`recover_stale`]: MessageChannel::recover_stale
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Durably appends an invocation. Once this returns `Ok` the message
    /// survives a crash of the producer.
    async fn enqueue(&self, invocation: &TaskInvocation) -> Result<()>;

    /// Waits up to `timeout` for a message and hands it to `consumer`.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing to deliver.
    /// No two consumers receive the same delivery.
    async fn dequeue(&self, consumer: &str, timeout: Duration) -> Result<Option<Delivery>>;

    /// Marks a delivery as fully handled so it is never redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Re-queues deliveries that have been in flight longer than `idle`.
    ///
    /// Returns the number of messages put back on the queue.
    async fn recover_stale(&self, idle: Duration) -> Result<u64>;

    /// Checks connectivity to the channel.
    async fn ping_channel(&self) -> Result<()>;
}

/// Key-value store of task status records.
///
/// Writes follow the lifecycle rules of [`TaskStatusRecord::supersedes`]:
/// terminal records are final and states never move backwards. Records
/// expire after the store's retention window regardless of reads.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Writes `record` only if no record exists for its task id.
    ///
    /// Returns `false` if a record was already present.
    async fn create_status(&self, record: &TaskStatusRecord) -> Result<bool>;

    /// Writes `record` if it supersedes the current one.
    ///
    /// Returns `false` when the write was rejected (for example because the
    /// task already reached a terminal state).
    async fn put_status(&self, record: &TaskStatusRecord) -> Result<bool>;

    /// Reads the current record, or `None` if the id is unknown or expired.
    async fn get_status(&self, task_id: &TaskId) -> Result<Option<TaskStatusRecord>>;

    /// Checks connectivity to the store.
    async fn ping_store(&self) -> Result<()>;

    /// Optional handle that is notified whenever a record changes.
    fn status_notify(&self) -> Option<&Arc<Notify>> {
        None
    }
}
