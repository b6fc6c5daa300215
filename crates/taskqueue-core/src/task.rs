//! Task definitions.
//!
//! A task type implements two traits:
//!
//! - [`TaskKind`] names the serialized form and its version, so stored tasks
//!   can be decoded by a [`TaskRegistry`](crate::TaskRegistry).
//! - [`Task`] holds the behaviour run by a queue worker.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Reindex { folder: String }
//!
//! impl TaskKind for Reindex {
//!     const KIND: &'static str = "reindex";
//! }
//!
//! #[async_trait]
//! impl Task for Reindex {
//!     fn description(&self) -> String {
//!         format!("Reindex {}", self.folder)
//!     }
//!
//!     async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<bool> {
//!         // ...
//!         Ok(true)
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use taskqueue_store::{EventId, TaskId};
use tokio_util::sync::CancellationToken;

use crate::error::{CodecError, QueueError};
use crate::event::Event;
use crate::manager::QueueManager;

/// Serialized identity of a task type.
pub trait TaskKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name stored with every task of this type.
    const KIND: &'static str;

    /// Current version of the serialized form.
    const VERSION: u32 = 1;

    /// Convert data written by an older version into the current form.
    fn upgrade(from_version: u32, data: Value) -> Result<Value, CodecError> {
        let _ = data;
        Err(CodecError::UnsupportedVersion {
            kind: Self::KIND.to_string(),
            found: from_version,
            supported: Self::VERSION,
        })
    }
}

/// Object-safe view of a task's serialized form.
///
/// Implemented for every [`TaskKind`].
pub trait TaskPayload: Send + Sync {
    fn kind(&self) -> &'static str;

    fn version(&self) -> u32;

    fn to_data(&self) -> Result<Value, CodecError>;
}

impl<T: TaskKind> TaskPayload for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn version(&self) -> u32 {
        T::VERSION
    }

    fn to_data(&self) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Unit of background work.
#[async_trait]
pub trait Task: TaskPayload {
    /// Human-readable description shown in listings.
    fn description(&self) -> String;

    /// Caller-defined grouping used by `has_active_tasks`.
    fn category(&self) -> i64 {
        0
    }

    /// Lower values run first.
    fn priority(&self) -> i64 {
        0
    }

    /// Delay before retry number `retries + 1`.
    ///
    /// Defaults to `2^(retries + 1)` seconds.
    fn retry_delay(&self, retries: u32) -> Duration {
        let secs = 1u64
            .checked_shl(retries.saturating_add(1))
            .unwrap_or(u64::MAX);
        Duration::from_secs(secs)
    }

    /// Run the task.
    ///
    /// Returns `Ok(true)` when done and `Ok(false)` to be requeued after
    /// `retry_delay`. An error (or a panic) marks the task failed.
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<bool>;
}

/// Handle given to a running task.
pub struct TaskContext {
    id: TaskId,
    queue: String,
    retries: u32,
    token: CancellationToken,
    manager: QueueManager,
    reset_retries: AtomicBool,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        queue: impl Into<String>,
        retries: u32,
        token: CancellationToken,
        manager: QueueManager,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            retries,
            token,
            manager,
            reset_retries: AtomicBool::new(false),
        }
    }

    /// Id of the running task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Queue the task runs in.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Number of times the task has been requeued.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Record an event against the running task.
    pub async fn store_event(&self, event: Event) -> Result<Option<EventId>, QueueError> {
        self.manager.store_task_event(self.id, event).await
    }

    /// Persist the task's current state so a restart resumes from it.
    pub async fn save_progress(&self, task: &dyn Task) -> Result<(), QueueError> {
        self.manager.update_task(self.id, task).await
    }

    /// Restart backoff from the first retry on the next requeue.
    pub fn reset_retry_counter(&self) {
        self.reset_retries.store(true, Ordering::SeqCst);
    }

    pub(crate) fn retries_reset(&self) -> bool {
        self.reset_retries.load(Ordering::SeqCst)
    }
}
