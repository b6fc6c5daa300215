//! Task record store trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::record::{
    EventId, EventRow, NewEvent, NewTask, RequeueOutcome, ScheduledTask, TaskId, TaskRow,
    TaskSnapshot,
};

/// Persistence for queues, tasks and events.
///
/// Every mutating operation that touches more than one row runs in a single
/// transaction. Operations on a task that no longer exists are silent no-ops,
/// since a task may be deleted while its queue is still running it.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Number of requeues allowed before a task fails.
    fn retry_limit(&self) -> u32;

    /// Create the named queue unless it already exists.
    async fn create_queue(&self, name: &str) -> Result<(), StoreError>;

    /// Names of all queues, ordered by name.
    async fn queue_names(&self) -> Result<Vec<String>, StoreError>;

    /// Names of queues holding at least one queued task.
    async fn queues_with_pending(&self) -> Result<Vec<String>, StoreError>;

    /// Insert a task in the named queue and return its id.
    async fn enqueue(&self, task: &NewTask, queue: &str) -> Result<TaskId, StoreError>;

    /// Find the next task the queue should run.
    ///
    /// Prefers the most urgent task runnable at `now`, ordered by
    /// (priority, retry_at, id); otherwise returns the earliest waiting task,
    /// ordered by (retry_at, priority, id), with the time left until it runs.
    async fn next_runnable(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledTask>, StoreError>;

    /// Overwrite the payload and category of an in-flight task.
    async fn persist_progress(&self, snapshot: &TaskSnapshot) -> Result<(), StoreError>;

    /// Mark a task completed, deleting it outright when it has no events.
    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError>;

    /// Mark a task failed with the given reason.
    async fn mark_failed(&self, snapshot: &TaskSnapshot, reason: &str) -> Result<(), StoreError>;

    /// Schedule another attempt, or fail the task once the retry limit is reached.
    async fn requeue(&self, snapshot: &TaskSnapshot) -> Result<RequeueOutcome, StoreError>;

    /// Attach an event to a task. Returns `None` when the task no longer exists.
    async fn store_event(
        &self,
        task_id: TaskId,
        event: &NewEvent,
    ) -> Result<Option<EventId>, StoreError>;

    /// Delete a task and its events.
    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError>;

    /// Delete a single event.
    async fn delete_event(&self, id: EventId) -> Result<(), StoreError>;

    /// Whether any task of the category is neither completed nor failed.
    async fn has_active_tasks(&self, category: i64) -> Result<bool, StoreError>;

    /// Delete tasks (and their events) last scheduled more than `days` ago.
    async fn purge_tasks_older_than(&self, days: u32) -> Result<u64, StoreError>;

    /// Delete events that occurred more than `days` ago.
    async fn purge_events_older_than(&self, days: u32) -> Result<u64, StoreError>;

    /// All tasks, newest first.
    async fn tasks(&self) -> Result<Vec<TaskRow>, StoreError>;

    /// A single task.
    async fn task(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError>;

    /// All events, oldest first.
    async fn events(&self) -> Result<Vec<EventRow>, StoreError>;

    /// Events attached to a task, oldest first.
    async fn events_for_task(&self, task_id: TaskId) -> Result<Vec<EventRow>, StoreError>;
}
