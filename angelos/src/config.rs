//! Deployment configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file
//! 2. Environment variables (with `ANGELOS_` prefix)
//!
//! Environment variables override TOML configuration. Every field has a
//! default, so an empty file is a valid configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! broker_url = "redis://127.0.0.1:6379/0"
//! result_ttl_secs = 86400
//! visibility_timeout_secs = 3600
//!
//! [worker]
//! concurrency = 4
//! pool_size = 2
//! task_timeout_secs = 300
//!
//! [beat]
//! tick_interval_ms = 1000
//!
//! [[beat.entries]]
//! name = "cleanup-every-minute"
//! task = "tasks.periodic_cleanup"
//! every_secs = 60.0
//! ```

use crate::executor::{Beat, Dispatcher, ScheduleEntry, TracingBehavior, Worker, WorkerPool};
use crate::storage::{MessageChannel, ResultStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address of the broker backing both the channel and the store.
    pub broker_url: String,

    /// How long status records are kept after their last update.
    pub result_ttl_secs: u64,

    /// How long a delivery may stay unacknowledged before redelivery.
    pub visibility_timeout_secs: u64,

    pub worker: WorkerConfig,

    pub beat: BeatConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "redis://127.0.0.1:6379/0".to_string(),
            result_ttl_secs: 24 * 3600,
            visibility_timeout_secs: 3600,
            worker: WorkerConfig::default(),
            beat: BeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Handlers each worker runs at once.
    pub concurrency: usize,

    /// How long one blocking dequeue waits before re-checking for shutdown.
    pub prefetch_timeout_ms: u64,

    /// How often workers scan for stale deliveries.
    pub recovery_interval_secs: u64,

    /// Per-task run time limit. Unlimited when absent.
    pub task_timeout_secs: Option<u64>,

    /// Worker ids are `{id_prefix}-{n}`.
    pub id_prefix: String,

    /// Workers started by one process.
    pub pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            prefetch_timeout_ms: 1000,
            recovery_interval_secs: 60,
            task_timeout_secs: None,
            id_prefix: "worker".to_string(),
            pool_size: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    pub tick_interval_ms: u64,
    pub entries: Vec<BeatEntryConfig>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            entries: Vec::new(),
        }
    }
}

/// One `[[beat.entries]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatEntryConfig {
    pub name: String,
    pub task: String,
    pub every_secs: f64,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

impl BeatEntryConfig {
    pub fn to_schedule_entry(&self) -> Result<ScheduleEntry, ConfigError> {
        let period = Duration::try_from_secs_f64(self.every_secs)
            .ok()
            .filter(|p| !p.is_zero())
            .ok_or_else(|| ConfigError::Invalid {
                field: format!("beat.entries.{}.every_secs", self.name),
                reason: format!("expected a positive number of seconds, got {}", self.every_secs),
            })?;

        Ok(ScheduleEntry::new(&self.name, &self.task, period).with_args(self.args.clone()))
    }
}

impl Config {
    /// Parse configuration from TOML content.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects interval settings that cannot drive a timer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.recovery_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.recovery_interval_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.beat.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "beat.tick_interval_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Load configuration from a file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `ANGELOS_BROKER_URL`, `ANGELOS_RESULT_TTL_SECS` and
    /// `ANGELOS_WORKER_CONCURRENCY` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("ANGELOS_BROKER_URL") {
            self.broker_url = url;
        }
        if let Some(ttl) = var("ANGELOS_RESULT_TTL_SECS") {
            self.result_ttl_secs = parse_var("ANGELOS_RESULT_TTL_SECS", &ttl)?;
        }
        if let Some(concurrency) = var("ANGELOS_WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_var("ANGELOS_WORKER_CONCURRENCY", &concurrency)?;
        }
        Ok(())
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Applies the worker settings to a worker builder.
    pub fn configure_worker<C, S, Tr>(&self, worker: Worker<C, S, Tr>) -> Worker<C, S, Tr>
    where
        C: MessageChannel + ?Sized + 'static,
        S: ResultStore + ?Sized + 'static,
        Tr: TracingBehavior,
    {
        let worker = worker
            .with_concurrency(self.worker.concurrency)
            .with_poll_timeout(Duration::from_millis(self.worker.prefetch_timeout_ms))
            .with_recovery_interval(Duration::from_secs(self.worker.recovery_interval_secs))
            .with_visibility_timeout(self.visibility_timeout());

        match self.worker.task_timeout_secs {
            Some(secs) => worker.with_task_timeout(Duration::from_secs(secs)),
            None => worker,
        }
    }

    /// Builds a pool of `pool_size` configured workers from a template.
    pub fn worker_pool<C, S, Tr>(&self, template: Worker<C, S, Tr>) -> WorkerPool<C, S, Tr>
    where
        C: MessageChannel + ?Sized + 'static,
        S: ResultStore + ?Sized + 'static,
        Tr: TracingBehavior,
    {
        WorkerPool::new(self.configure_worker(template)).with_size(self.worker.pool_size)
    }

    /// Builds a beat with the configured tick interval and schedule table.
    pub fn beat<C, S>(&self, dispatcher: Dispatcher<C, S>) -> Result<Beat<C, S>, ConfigError>
    where
        C: MessageChannel + ?Sized + 'static,
        S: ResultStore + ?Sized + 'static,
    {
        let entries = self
            .beat
            .entries
            .iter()
            .map(BeatEntryConfig::to_schedule_entry)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Beat::new(dispatcher)
            .with_tick_interval(Duration::from_millis(self.beat.tick_interval_ms))
            .with_entries(entries))
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field: key.to_string(),
        reason: e.to_string(),
    })
}
