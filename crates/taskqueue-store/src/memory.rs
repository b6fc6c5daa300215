//! In-memory task record store.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::record::{
    add_delay, cutoff, wait_until, EventId, EventRow, NewEvent, NewTask, RequeueOutcome,
    ScheduledTask, TaskId, TaskRow, TaskSnapshot, TaskStatus, DEFAULT_RETRY_LIMIT,
    RETRY_LIMIT_EXCEEDED,
};
use crate::store::TaskStore;

#[derive(Debug, Clone)]
struct StoredTask {
    queue: String,
    status: TaskStatus,
    category: i64,
    priority: i64,
    retries: u32,
    queued_at: DateTime<Utc>,
    retry_at: DateTime<Utc>,
    failure_reason: Option<String>,
    exception: Option<String>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    queues: BTreeSet<String>,
    tasks: BTreeMap<TaskId, StoredTask>,
    events: BTreeMap<EventId, EventRow>,
    last_task_id: TaskId,
    last_event_id: EventId,
}

impl State {
    fn event_count(&self, task_id: TaskId) -> u64 {
        self.events
            .values()
            .filter(|e| e.task_id == Some(task_id))
            .count() as u64
    }

    fn row(&self, id: TaskId, task: &StoredTask) -> TaskRow {
        TaskRow {
            id,
            queue: task.queue.clone(),
            status: task.status,
            category: task.category,
            priority: task.priority,
            retries: task.retries,
            queued_at: task.queued_at,
            retry_at: task.retry_at,
            failure_reason: task.failure_reason.clone(),
            exception: task.exception.clone(),
            payload: task.payload.clone(),
            event_count: self.event_count(id),
        }
    }

    fn apply_snapshot(&mut self, snapshot: &TaskSnapshot) -> Option<&mut StoredTask> {
        let task = self.tasks.get_mut(&snapshot.id)?;
        if let Some(payload) = &snapshot.payload {
            task.payload = payload.clone();
        }
        task.category = snapshot.category;
        if snapshot.exception.is_some() {
            task.exception = snapshot.exception.clone();
        }
        Some(task)
    }

    fn mark_failed(&mut self, snapshot: &TaskSnapshot, reason: &str) {
        if let Some(task) = self.apply_snapshot(snapshot) {
            task.status = TaskStatus::Failed;
            task.failure_reason = Some(reason.to_string());
        }
    }

    /// Remove orphaned events and eventless completed tasks.
    fn cleanup_orphans(&mut self) {
        let tasks = &self.tasks;
        self.events
            .retain(|_, e| e.task_id.is_none_or(|id| tasks.contains_key(&id)));

        let with_events: BTreeSet<TaskId> =
            self.events.values().filter_map(|e| e.task_id).collect();
        self.tasks
            .retain(|id, t| t.status != TaskStatus::Completed || with_events.contains(id));
    }
}

/// In-memory task store with the same semantics as the SQLite store.
pub struct MemoryTaskStore {
    state: RwLock<State>,
    retry_limit: u32,
}

impl MemoryTaskStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    /// Set the number of requeues allowed before a task fails.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    async fn create_queue(&self, name: &str) -> Result<(), StoreError> {
        self.state.write().await.queues.insert(name.to_string());
        Ok(())
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.read().await.queues.iter().cloned().collect())
    }

    async fn queues_with_pending(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        let names: BTreeSet<&String> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(|t| &t.queue)
            .collect();
        Ok(names.into_iter().cloned().collect())
    }

    async fn enqueue(&self, task: &NewTask, queue: &str) -> Result<TaskId, StoreError> {
        let mut state = self.state.write().await;
        if !state.queues.contains(queue) {
            return Err(StoreError::QueueNotFound(queue.to_string()));
        }

        let now = Utc::now();
        state.last_task_id += 1;
        let id = state.last_task_id;
        state.tasks.insert(
            id,
            StoredTask {
                queue: queue.to_string(),
                status: TaskStatus::Queued,
                category: task.category,
                priority: task.priority,
                retries: 0,
                queued_at: now,
                retry_at: now,
                failure_reason: None,
                exception: None,
                payload: task.payload.clone(),
            },
        );
        Ok(id)
    }

    async fn next_runnable(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledTask>, StoreError> {
        let state = self.state.read().await;
        let queued = || {
            state
                .tasks
                .iter()
                .filter(|(_, t)| t.queue == queue && t.status == TaskStatus::Queued)
        };

        let found = queued()
            .filter(|(_, t)| t.retry_at <= now)
            .min_by_key(|(id, t)| (t.priority, t.retry_at, **id))
            .or_else(|| {
                queued()
                    .filter(|(_, t)| t.retry_at > now)
                    .min_by_key(|(id, t)| (t.retry_at, t.priority, **id))
            });

        Ok(found.map(|(id, t)| ScheduledTask {
            id: *id,
            payload: t.payload.clone(),
            retries: t.retries,
            wait: wait_until(now, t.retry_at),
        }))
    }

    async fn persist_progress(&self, snapshot: &TaskSnapshot) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(task) = state.tasks.get_mut(&snapshot.id) {
            if let Some(payload) = &snapshot.payload {
                task.payload = payload.clone();
            }
            task.category = snapshot.category;
        }
        Ok(())
    }

    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.event_count(id) > 0 {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.status = TaskStatus::Completed;
            }
        } else {
            state.tasks.remove(&id);
        }
        Ok(())
    }

    async fn mark_failed(&self, snapshot: &TaskSnapshot, reason: &str) -> Result<(), StoreError> {
        self.state.write().await.mark_failed(snapshot, reason);
        Ok(())
    }

    async fn requeue(&self, snapshot: &TaskSnapshot) -> Result<RequeueOutcome, StoreError> {
        let mut state = self.state.write().await;
        if snapshot.retries >= self.retry_limit {
            state.mark_failed(snapshot, RETRY_LIMIT_EXCEEDED);
            return Ok(RequeueOutcome::RetryLimitExceeded);
        }

        let retry_at = add_delay(Utc::now(), snapshot.retry_delay);
        if let Some(task) = state.apply_snapshot(snapshot) {
            task.retry_at = retry_at;
            task.retries = snapshot.retries.saturating_add(1);
        }
        Ok(RequeueOutcome::Requeued { retry_at })
    }

    async fn store_event(
        &self,
        task_id: TaskId,
        event: &NewEvent,
    ) -> Result<Option<EventId>, StoreError> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(&task_id) {
            return Ok(None);
        }

        state.last_event_id += 1;
        let id = state.last_event_id;
        state.events.insert(
            id,
            EventRow {
                id,
                task_id: Some(task_id),
                payload: event.payload.clone(),
                occurred_at: Utc::now(),
            },
        );
        Ok(Some(id))
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.events.retain(|_, e| e.task_id != Some(id));
        state.tasks.remove(&id);
        state.cleanup_orphans();
        Ok(())
    }

    async fn delete_event(&self, id: EventId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.events.remove(&id);
        state.cleanup_orphans();
        Ok(())
    }

    async fn has_active_tasks(&self, category: i64) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .any(|t| t.category == category && !t.status.is_terminal()))
    }

    async fn purge_tasks_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = cutoff(Utc::now(), days);
        let mut state = self.state.write().await;

        let old: BTreeSet<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, t)| t.retry_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        state
            .events
            .retain(|_, e| e.task_id.is_none_or(|id| !old.contains(&id)));
        state.tasks.retain(|id, _| !old.contains(id));
        state.cleanup_orphans();
        Ok(old.len() as u64)
    }

    async fn purge_events_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = cutoff(Utc::now(), days);
        let mut state = self.state.write().await;

        let before = state.events.len();
        state.events.retain(|_, e| e.occurred_at >= cutoff);
        let deleted = before - state.events.len();
        state.cleanup_orphans();
        Ok(deleted as u64)
    }

    async fn tasks(&self) -> Result<Vec<TaskRow>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .iter()
            .rev()
            .map(|(id, t)| state.row(*id, t))
            .collect())
    }

    async fn task(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError> {
        let state = self.state.read().await;
        Ok(state.tasks.get(&id).map(|t| state.row(id, t)))
    }

    async fn events(&self) -> Result<Vec<EventRow>, StoreError> {
        Ok(self.state.read().await.events.values().cloned().collect())
    }

    async fn events_for_task(&self, task_id: TaskId) -> Result<Vec<EventRow>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .values()
            .filter(|e| e.task_id == Some(task_id))
            .cloned()
            .collect())
    }
}
