//! Record types exchanged with the store.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Task identifier, assigned by the store on insert.
pub type TaskId = i64;

/// Event identifier, assigned by the store on insert.
pub type EventId = i64;

/// Failure reason recorded when a task is requeued too many times.
pub const RETRY_LIMIT_EXCEEDED: &str = "Retry limit exceeded";

/// Requeues allowed before a task is failed, unless configured otherwise.
pub const DEFAULT_RETRY_LIMIT: u32 = 15;

/// Persisted task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting in its queue, either runnable now or after `retry_at`.
    Queued,
    /// Finished successfully; only kept while it has events attached.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl TaskStatus {
    /// Single-character code stored in the `status_code` column.
    pub fn code(self) -> &'static str {
        match self {
            TaskStatus::Queued => "Q",
            TaskStatus::Completed => "S",
            TaskStatus::Failed => "F",
        }
    }

    /// Parse a `status_code` column value.
    pub fn from_code(code: &str) -> Result<Self, StoreError> {
        match code {
            "Q" => Ok(TaskStatus::Queued),
            "S" => Ok(TaskStatus::Completed),
            "F" => Ok(TaskStatus::Failed),
            other => Err(StoreError::InvalidRecord(format!(
                "unknown task status code '{}'",
                other
            ))),
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Queued)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A task about to be inserted.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub category: i64,
    pub priority: i64,
    pub payload: Vec<u8>,
}

/// State of an in-flight task to be written back after (or during) a run.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub category: i64,
    /// Encoded task; `None` keeps the stored payload untouched.
    pub payload: Option<Vec<u8>>,
    /// Retry count the task was run with.
    pub retries: u32,
    /// Delay before the next attempt if the task is requeued.
    pub retry_delay: Duration,
    /// Text of the last fault raised by the task.
    pub exception: Option<String>,
}

/// An event about to be attached to a task.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub payload: Vec<u8>,
}

/// The next task a queue should run, as found by `TaskStore::next_runnable`.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: TaskId,
    /// Encoded task, decoded by the caller only when it is about to run.
    pub payload: Vec<u8>,
    pub retries: u32,
    /// Time until the task may run; zero when it is runnable now.
    pub wait: Duration,
}

impl ScheduledTask {
    pub fn is_runnable(&self) -> bool {
        self.wait.is_zero()
    }
}

/// Result of requeueing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Task stays queued and will run again at `retry_at`.
    Requeued { retry_at: DateTime<Utc> },
    /// Task hit the retry limit and was marked failed.
    RetryLimitExceeded,
}

/// A stored task as listed for inspection.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: TaskId,
    pub queue: String,
    pub status: TaskStatus,
    pub category: i64,
    pub priority: i64,
    pub retries: u32,
    pub queued_at: DateTime<Utc>,
    pub retry_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub exception: Option<String>,
    pub payload: Vec<u8>,
    pub event_count: u64,
}

/// A stored event.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: EventId,
    pub task_id: Option<TaskId>,
    pub payload: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
}

/// Format a timestamp for storage.
///
/// Fixed millisecond precision and a `Z` suffix keep lexical order equal to
/// chronological order, which the SQL comparisons rely on.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRecord(format!("bad timestamp '{}': {}", text, e)))
}

/// Time from `now` until `at`, zero if `at` is not in the future.
pub fn wait_until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Longest delay a retry is scheduled for; keeps timestamps within four-digit years.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Add a delay to a timestamp, clamped to `MAX_RETRY_DELAY`.
pub fn add_delay(time: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = delay.min(MAX_RETRY_DELAY);
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| time.checked_add_signed(d))
        .unwrap_or(time)
}

/// Cutoff timestamp for "older than `days`".
pub fn cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - chrono::Duration::days(i64::from(days))
}
