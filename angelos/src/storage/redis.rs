//! Redis backend: Streams for the message channel, hashes for the result store.
//!
//! Workers can run on separate machines; all they share is the Redis server.
//!
//! # Data Structures
//!
//! ## Channel (Streams-based)
//! - `angelos:tasks` (STREAM): task invocations, consumed through the
//!   `workers` consumer group
//!   - Each entry contains: task_id, task_name, args (JSON), enqueued_at,
//!     delivery_count
//!   - The Pending Entries List (PEL) tracks delivered-but-unacked entries
//!
//! ## Result Store (Hash-based)
//! - `angelos:task:{task_id}` (HASH): state, rank, updated_at (ms), record (JSON)
//!   - Expires `result_ttl` after the last accepted write
//!
//! # Delivery Semantics
//!
//! - Enqueue: XADD, acknowledged by Redis before `enqueue` returns
//! - Dequeue: XREADGROUP with `>`; the entry joins the PEL for this consumer
//! - Ack: XACK once the worker has recorded the outcome
//! - Recovery: XAUTOCLAIM entries idle past the visibility timeout, re-add
//!   them with `delivery_count + 1`, then XACK the stale entry
//!
//! Status writes go through a Lua script so the "never leave a terminal
//! state, never move backwards" check and the write happen atomically.

use super::{
    error::Result, error::StorageError, Delivery, MessageChannel, ResultStore, DEFAULT_RESULT_TTL,
};
use crate::core::{deserialize_value, serialize_value, TaskId, TaskInvocation, TaskStatusRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::{
    streams::{StreamId, StreamReadOptions, StreamReadReply},
    AsyncCommands,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream key for the task queue
const STREAM_KEY: &str = "angelos:tasks";

/// Consumer group shared by all workers
const CONSUMER_GROUP: &str = "workers";

/// Consumer name used when claiming stale entries
const RECOVERY_CONSUMER: &str = "recovery-agent";

/// Max stream length (approximate trimming for performance)
const DEFAULT_MAX_STREAM_LEN: usize = 100_000;

/// Rank of terminal states, mirrored from `TaskState::rank`
const TERMINAL_RANK: u8 = 2;

/// Conditional status write.
///
/// KEYS[1] = record key
/// ARGV = mode ("create" | "put"), rank, updated_at_ms, state, record_json, ttl_ms
const STATUS_WRITE_SCRIPT: &str = r#"
local cur_rank = redis.call('HGET', KEYS[1], 'rank')
if cur_rank then
    if ARGV[1] == 'create' then
        return 0
    end
    cur_rank = tonumber(cur_rank)
    local new_rank = tonumber(ARGV[2])
    if cur_rank >= tonumber(ARGV[7]) or new_rank < cur_rank then
        return 0
    end
    if new_rank == cur_rank then
        local cur_ts = tonumber(redis.call('HGET', KEYS[1], 'updated_at') or '0')
        if tonumber(ARGV[3]) < cur_ts then
            return 0
        end
    end
end
redis.call('HSET', KEYS[1], 'state', ARGV[4], 'rank', ARGV[2], 'updated_at', ARGV[3], 'record', ARGV[5])
redis.call('PEXPIRE', KEYS[1], ARGV[6])
return 1
"#;

/// Redis message channel and result store using async connection pooling.
pub struct RedisBroker {
    pool: Pool,
    result_ttl: Duration,
    max_stream_len: usize,
    status_script: redis::Script,
}

impl RedisBroker {
    /// Connects to Redis and makes sure the consumer group exists.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379/0")
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use angelos::storage::RedisBroker;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let broker = RedisBroker::new("redis://localhost:6379/0").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(redis_url: &str) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::ChannelUnavailable(e.to_string()))?;

        let broker = Self {
            pool,
            result_ttl: DEFAULT_RESULT_TTL,
            max_stream_len: DEFAULT_MAX_STREAM_LEN,
            status_script: redis::Script::new(STATUS_WRITE_SCRIPT),
        };

        broker.ensure_consumer_group().await?;

        Ok(broker)
    }

    /// Sets how long status records are retained after their last write.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Sets the approximate cap on stream length.
    pub fn with_max_stream_len(mut self, len: usize) -> Self {
        self.max_stream_len = len;
        self
    }

    /// Deletes the task stream and every status record. Intended for tests.
    pub async fn reset(&self) -> Result<()> {
        let mut conn = self.channel_connection().await?;

        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg("angelos:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await
                .map_err(|e| StorageError::StoreUnavailable(e.to_string()))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if !keys.is_empty() {
            let _: () = conn
                .del(&keys)
                .await
                .map_err(|e| StorageError::StoreUnavailable(e.to_string()))?;
        }

        self.ensure_consumer_group().await
    }

    async fn channel_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::ChannelUnavailable(e.to_string()))
    }

    async fn store_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::StoreUnavailable(e.to_string()))
    }

    /// Ensures the consumer group exists, creating it if necessary.
    async fn ensure_consumer_group(&self) -> Result<()> {
        let mut conn = self.channel_connection().await?;

        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(STREAM_KEY)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        match result {
            Ok(()) => {
                debug!(
                    "Created consumer group '{}' for stream '{}'",
                    CONSUMER_GROUP, STREAM_KEY
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(StorageError::ChannelUnavailable(format!(
                "failed to create consumer group: {}",
                e
            ))),
        }
    }

    fn record_key(task_id: &TaskId) -> String {
        format!("angelos:task:{}", task_id)
    }

    /// XADDs one invocation with the given delivery count.
    async fn add_to_stream(
        &self,
        conn: &mut deadpool_redis::Connection,
        invocation: &TaskInvocation,
        delivery_count: u32,
    ) -> Result<String> {
        let args = String::from_utf8(serialize_value(&invocation.args)?)
            .map_err(|e| StorageError::InvalidParameter(e.to_string()))?;

        let fields: Vec<(&str, String)> = vec![
            ("task_id", invocation.task_id.to_string()),
            ("task_name", invocation.task_name.clone()),
            ("args", args),
            ("enqueued_at", invocation.enqueued_at.to_rfc3339()),
            ("delivery_count", delivery_count.to_string()),
        ];

        redis::cmd("XADD")
            .arg(STREAM_KEY)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_stream_len)
            .arg("*")
            .arg(&fields)
            .query_async(&mut **conn)
            .await
            .map_err(|e| StorageError::ChannelUnavailable(format!("XADD failed: {}", e)))
    }

    /// Decodes a stream entry into an invocation and its delivery count.
    fn parse_stream_entry(entry: &StreamId) -> Result<(TaskInvocation, u32)> {
        let get_string = |field: &str| -> Option<String> {
            match entry.map.get(field)? {
                redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
                redis::Value::SimpleString(s) => Some(s.clone()),
                redis::Value::Int(i) => Some(i.to_string()),
                _ => None,
            }
        };
        let required = |field: &str| -> Result<String> {
            get_string(field).ok_or_else(|| {
                StorageError::MalformedMessage(format!(
                    "missing {} in stream entry {}",
                    field, entry.id
                ))
            })
        };

        let task_id = TaskId::from(required("task_id")?);
        let task_name = required("task_name")?;
        let args = deserialize_value(required("args")?.as_bytes())?;
        let enqueued_at = get_string("enqueued_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let delivery_count = get_string("delivery_count")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Ok((
            TaskInvocation {
                task_id,
                task_name,
                args,
                enqueued_at,
            },
            delivery_count,
        ))
    }

    async fn write_status(&self, mode: &str, record: &TaskStatusRecord) -> Result<bool> {
        let mut conn = self.store_connection().await?;
        let record_json = String::from_utf8(serialize_value(record)?)
            .map_err(|e| StorageError::InvalidParameter(e.to_string()))?;
        let ttl_ms = i64::try_from(self.result_ttl.as_millis())
            .map_err(|e| StorageError::InvalidParameter(format!("result ttl: {}", e)))?;

        let applied: i32 = self
            .status_script
            .key(Self::record_key(&record.task_id))
            .arg(mode)
            .arg(record.state.rank())
            .arg(record.updated_at.timestamp_millis())
            .arg(record.state.as_str())
            .arg(record_json)
            .arg(ttl_ms)
            .arg(TERMINAL_RANK)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StorageError::StoreUnavailable(e.to_string()))?;

        Ok(applied == 1)
    }
}

#[async_trait]
impl MessageChannel for RedisBroker {
    async fn enqueue(&self, invocation: &TaskInvocation) -> Result<()> {
        let mut conn = self.channel_connection().await?;
        let entry_id = self.add_to_stream(&mut conn, invocation, 1).await?;

        debug!(
            "Enqueued task {} ({}) with entry ID {}",
            invocation.task_id, invocation.task_name, entry_id
        );
        Ok(())
    }

    async fn dequeue(&self, consumer: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.channel_connection().await?;

        // BLOCK 0 would wait forever
        let block_ms = timeout.as_millis().clamp(1, usize::MAX as u128) as usize;
        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(1)
            .block(block_ms);

        let reply: StreamReadReply = match conn.xread_options(&[STREAM_KEY], &[">"], &opts).await {
            Ok(r) => r,
            Err(e) if e.to_string().contains("NOGROUP") => {
                warn!("Consumer group missing, recreating...");
                self.ensure_consumer_group().await?;
                conn.xread_options(&[STREAM_KEY], &[">"], &opts)
                    .await
                    .map_err(|e| {
                        StorageError::ChannelUnavailable(format!("XREADGROUP failed: {}", e))
                    })?
            }
            Err(e) => {
                return Err(StorageError::ChannelUnavailable(format!(
                    "XREADGROUP failed: {}",
                    e
                )))
            }
        };

        let Some(entry) = reply.keys.first().and_then(|key| key.ids.first()) else {
            return Ok(None);
        };

        match Self::parse_stream_entry(entry) {
            Ok((invocation, delivery_count)) => {
                debug!(
                    "Consumer {} dequeued task {} (entry {}, delivery {})",
                    consumer, invocation.task_id, entry.id, delivery_count
                );
                Ok(Some(Delivery {
                    invocation,
                    receipt: entry.id.clone(),
                    consumer: consumer.to_string(),
                    delivery_count,
                }))
            }
            Err(e) => {
                // Unparseable entries would otherwise be redelivered forever.
                warn!(
                    "Failed to parse stream entry {}: {}, acknowledging to skip",
                    entry.id, e
                );
                let _: u64 = conn
                    .xack(STREAM_KEY, CONSUMER_GROUP, &[&entry.id])
                    .await
                    .map_err(|e| StorageError::ChannelUnavailable(e.to_string()))?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.channel_connection().await?;
        let acked: u64 = conn
            .xack(STREAM_KEY, CONSUMER_GROUP, &[&delivery.receipt])
            .await
            .map_err(|e| StorageError::ChannelUnavailable(e.to_string()))?;

        if acked == 0 {
            return Err(StorageError::UnknownDelivery(delivery.receipt.clone()));
        }
        debug!(
            "Acknowledged stream entry {} for task {}",
            delivery.receipt, delivery.invocation.task_id
        );
        Ok(())
    }

    async fn recover_stale(&self, idle: Duration) -> Result<u64> {
        let mut conn = self.channel_connection().await?;
        let idle_ms = i64::try_from(idle.as_millis())
            .map_err(|e| StorageError::InvalidParameter(format!("idle: {}", e)))?;

        let mut recovered = 0u64;
        let mut cursor = "0-0".to_string();

        loop {
            let result: redis::Value = redis::cmd("XAUTOCLAIM")
                .arg(STREAM_KEY)
                .arg(CONSUMER_GROUP)
                .arg(RECOVERY_CONSUMER)
                .arg(idle_ms)
                .arg(&cursor)
                .arg("COUNT")
                .arg(10)
                .query_async(&mut *conn)
                .await
                .map_err(|e| StorageError::ChannelUnavailable(format!("XAUTOCLAIM failed: {}", e)))?;

            // Reply: [next_cursor, [claimed entries], [deleted ids]]
            let (next_cursor, claimed) = match result {
                redis::Value::Array(mut parts) if parts.len() >= 2 => {
                    let claimed = match parts.swap_remove(1) {
                        redis::Value::Array(entries) => entries,
                        _ => Vec::new(),
                    };
                    let next_cursor: String =
                        redis::from_redis_value(&parts[0]).unwrap_or_else(|_| "0-0".to_string());
                    (next_cursor, claimed)
                }
                _ => {
                    warn!("Unexpected XAUTOCLAIM response format");
                    break;
                }
            };

            for value in &claimed {
                // Entries trimmed from the stream come back as nil
                let Ok(entry) = redis::from_redis_value::<StreamId>(value) else {
                    continue;
                };

                match Self::parse_stream_entry(&entry) {
                    Ok((invocation, delivery_count)) => {
                        self.add_to_stream(&mut conn, &invocation, delivery_count + 1)
                            .await?;
                        debug!(
                            "Re-queued stale task {} (delivery {})",
                            invocation.task_id,
                            delivery_count + 1
                        );
                        recovered += 1;
                    }
                    Err(e) => warn!("Dropping unparseable stale entry {}: {}", entry.id, e),
                }

                let _: u64 = conn
                    .xack(STREAM_KEY, CONSUMER_GROUP, &[&entry.id])
                    .await
                    .map_err(|e| StorageError::ChannelUnavailable(e.to_string()))?;
            }

            cursor = next_cursor;
            if cursor == "0-0" {
                break;
            }
        }

        if recovered > 0 {
            info!("Recovered {} stale deliveries via XAUTOCLAIM", recovered);
        }
        Ok(recovered)
    }

    async fn ping_channel(&self) -> Result<()> {
        let mut conn = self.channel_connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::ChannelUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for RedisBroker {
    async fn create_status(&self, record: &TaskStatusRecord) -> Result<bool> {
        self.write_status("create", record).await
    }

    async fn put_status(&self, record: &TaskStatusRecord) -> Result<bool> {
        let applied = self.write_status("put", record).await?;
        if !applied {
            debug!(
                "Rejected {} write for task {}: record already further along",
                record.state, record.task_id
            );
        }
        Ok(applied)
    }

    async fn get_status(&self, task_id: &TaskId) -> Result<Option<TaskStatusRecord>> {
        let mut conn = self.store_connection().await?;
        let raw: Option<Vec<u8>> = conn
            .hget(Self::record_key(task_id), "record")
            .await
            .map_err(|e| StorageError::StoreUnavailable(e.to_string()))?;

        raw.map(|bytes| deserialize_value(&bytes).map_err(StorageError::from))
            .transpose()
    }

    async fn ping_store(&self) -> Result<()> {
        let mut conn = self.store_connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}
