//! Configuration schema definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the queue for long-running tasks, or tasks that can just wait.
pub const MAIN_QUEUE: &str = "main";

/// Name of the queue for trivial background tasks that only take a few seconds.
pub const SMALL_JOBS_QUEUE: &str = "small_jobs";

/// Number of times a task may be requeued before it is marked as failed.
pub const DEFAULT_RETRY_LIMIT: u32 = 15;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Task record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    taskqueue_dir().join("taskqueue.db")
}

/// Queue manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queues created when the manager starts.
    #[serde(default = "default_queue_names")]
    pub names: Vec<String>,

    /// Maximum retries before a requeued task is marked as failed.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            names: default_queue_names(),
            retry_limit: default_retry_limit(),
        }
    }
}

fn default_queue_names() -> Vec<String> {
    vec![MAIN_QUEUE.to_string(), SMALL_JOBS_QUEUE.to_string()]
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

/// Age-based retention of finished tasks and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Tasks whose last schedule time is older than this are purged.
    #[serde(default = "default_task_days")]
    pub task_days: u32,

    /// Events older than this are purged.
    #[serde(default = "default_event_days")]
    pub event_days: u32,

    /// Run the retention sweep when the queue manager starts.
    #[serde(default)]
    pub sweep_on_start: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            task_days: default_task_days(),
            event_days: default_event_days(),
            sweep_on_start: false,
        }
    }
}

fn default_task_days() -> u32 {
    28
}

fn default_event_days() -> u32 {
    14
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rotated log files; console only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Get the `~/.taskqueue` directory path.
pub fn taskqueue_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".taskqueue"))
        .unwrap_or_else(|| PathBuf::from(".taskqueue"))
}
