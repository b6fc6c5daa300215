//! Queue manager.
//!
//! Owns the store, the task registry and the set of running queue workers.
//! One manager-wide lock serializes every "pick a task" and "record its
//! outcome" sequence with enqueue, delete and worker registration, so a task
//! is never handed out twice and a queue never has two workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskqueue_config::Config;
use taskqueue_store::{
    EventId, NewTask, TaskId, TaskRow, TaskSnapshot, TaskStatus, TaskStore,
};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{encode_task, stored_description, TaskRegistry, UNREADABLE_TASK_DESCRIPTION};
use crate::error::QueueError;
use crate::event::Event;
use crate::notify::{Change, ChangeNotifier};
use crate::task::Task;
use crate::worker::QueueWorker;

/// A running worker and its task handle.
pub(crate) struct WorkerEntry {
    worker: Arc<QueueWorker>,
    handle: JoinHandle<()>,
}

pub(crate) type Workers = HashMap<String, WorkerEntry>;

/// A stored task as shown in listings.
#[derive(Debug, Clone)]
pub struct TaskInfo {
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
    pub event_count: u64,
    pub description: String,
    /// Whether the stored envelope could be read.
    pub readable: bool,
}

impl From<TaskRow> for TaskInfo {
    fn from(row: TaskRow) -> Self {
        let (description, readable) = match stored_description(&row.payload) {
            Ok(description) => (description, true),
            Err(e) => {
                debug!("Task {} is unreadable: {}", row.id, e);
                (UNREADABLE_TASK_DESCRIPTION.to_string(), false)
            }
        };

        Self {
            id: row.id,
            queue: row.queue,
            status: row.status,
            category: row.category,
            priority: row.priority,
            retries: row.retries,
            queued_at: row.queued_at,
            retry_at: row.retry_at,
            failure_reason: row.failure_reason,
            exception: row.exception,
            event_count: row.event_count,
            description,
            readable,
        }
    }
}

struct ManagerInner {
    store: Arc<dyn TaskStore>,
    registry: TaskRegistry,
    workers: Mutex<Workers>,
    notifier: ChangeNotifier,
    shutdown: CancellationToken,
    next_generation: AtomicU64,
}

/// Entry point for enqueueing, inspecting and managing tasks.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl QueueManager {
    /// Create a manager without starting any workers.
    pub fn new(store: Arc<dyn TaskStore>, registry: TaskRegistry) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                registry,
                workers: Mutex::new(HashMap::new()),
                notifier: ChangeNotifier::default(),
                shutdown: CancellationToken::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Create a manager, prepare the configured queues and resume pending work.
    ///
    /// The retry limit is enforced by the store, so `store` should be built
    /// with `config.queues.retry_limit` (e.g. `SqliteTaskStore::with_retry_limit`).
    /// A mismatch is logged and the store's limit wins.
    pub async fn start(
        config: &Config,
        store: Arc<dyn TaskStore>,
        registry: TaskRegistry,
    ) -> Result<Self, QueueError> {
        if store.retry_limit() != config.queues.retry_limit {
            warn!(
                "Store retry limit {} differs from configured queues.retry_limit {}",
                store.retry_limit(),
                config.queues.retry_limit
            );
        }
        let manager = Self::new(store, registry);

        for name in &config.queues.names {
            manager.inner.store.create_queue(name).await?;
        }

        if config.retention.sweep_on_start {
            manager
                .purge_tasks_older_than(config.retention.task_days)
                .await?;
            manager
                .purge_events_older_than(config.retention.event_days)
                .await?;
        }

        let resumed = manager.resume().await?;
        info!(
            "Queue manager started ({} queues resumed: {:?})",
            resumed.len(),
            resumed
        );
        Ok(manager)
    }

    /// Start a worker for every queue with queued tasks and no worker.
    ///
    /// Returns the names of the queues that got a new worker.
    pub async fn resume(&self) -> Result<Vec<String>, QueueError> {
        let mut workers = self.lock_workers().await;
        if self.is_shut_down() {
            return Err(QueueError::ShuttingDown);
        }

        let mut started = Vec::new();
        for queue in self.inner.store.queues_with_pending().await? {
            if !workers.contains_key(&queue) {
                self.spawn_worker(&mut workers, &queue);
                started.push(queue);
            }
        }
        Ok(started)
    }

    /// Persist a task and make sure its queue is running.
    pub async fn enqueue_task(&self, queue: &str, task: &dyn Task) -> Result<TaskId, QueueError> {
        let new_task = NewTask {
            category: task.category(),
            priority: task.priority(),
            payload: encode_task(task)?,
        };

        let mut workers = self.lock_workers().await;
        if self.is_shut_down() {
            return Err(QueueError::ShuttingDown);
        }

        self.inner.store.create_queue(queue).await?;
        let id = self.inner.store.enqueue(&new_task, queue).await?;

        match workers.get(queue) {
            Some(entry) => entry.worker.wake(),
            None => self.spawn_worker(&mut workers, queue),
        }
        drop(workers);

        debug!("Enqueued task {} in '{}': {}", id, queue, task.description());
        self.inner.notifier.send(Change::Tasks);
        Ok(id)
    }

    /// Save the current state of a task.
    pub async fn update_task(&self, id: TaskId, task: &dyn Task) -> Result<(), QueueError> {
        let snapshot = TaskSnapshot {
            id,
            category: task.category(),
            payload: Some(encode_task(task)?),
            retries: 0,
            retry_delay: Duration::ZERO,
            exception: None,
        };

        let workers = self.lock_workers().await;
        self.inner.store.persist_progress(&snapshot).await?;
        drop(workers);

        self.inner.notifier.send(Change::Tasks);
        Ok(())
    }

    /// Delete a task and its events.
    ///
    /// A task that is currently running is cancelled instead; its worker
    /// deletes it once `run` returns.
    pub async fn delete_task(&self, id: TaskId) -> Result<(), QueueError> {
        let workers = self.lock_workers().await;
        if Self::cancel_running(&workers, id) {
            info!("Task {} is running, cancelling", id);
        } else {
            self.inner.store.delete_task(id).await?;
        }
        drop(workers);

        self.inner.notifier.send(Change::Tasks);
        self.inner.notifier.send(Change::Events);
        Ok(())
    }

    /// Request cancellation of a running task.
    ///
    /// Returns `false` when no worker is running the task. A cancelled task
    /// is deleted by its worker once `run` returns.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let workers = self.lock_workers().await;
        Self::cancel_running(&workers, id)
    }

    /// Attach an event to a task.
    ///
    /// Returns `None` when the task no longer exists.
    pub async fn store_task_event(
        &self,
        task_id: TaskId,
        mut event: Event,
    ) -> Result<Option<EventId>, QueueError> {
        let encoded = event.encode()?;

        let workers = self.lock_workers().await;
        let id = self.inner.store.store_event(task_id, &encoded).await?;
        drop(workers);

        match id {
            Some(id) => {
                event.id = Some(id);
                event.task_id = Some(task_id);
                debug!("Task {} event {}: {}", task_id, id, event);
                self.inner.notifier.send(Change::Events);
                self.inner.notifier.send(Change::Tasks);
            }
            None => warn!("Dropped event for missing task {}: {}", task_id, event),
        }
        Ok(id)
    }

    /// Delete a single event.
    pub async fn delete_event(&self, id: EventId) -> Result<(), QueueError> {
        let workers = self.lock_workers().await;
        self.inner.store.delete_event(id).await?;
        drop(workers);

        self.inner.notifier.send(Change::Events);
        self.inner.notifier.send(Change::Tasks);
        Ok(())
    }

    /// Whether any task of the category is neither completed nor failed.
    pub async fn has_active_tasks(&self, category: i64) -> Result<bool, QueueError> {
        Ok(self.inner.store.has_active_tasks(category).await?)
    }

    /// Delete tasks last scheduled more than `days` ago.
    pub async fn purge_tasks_older_than(&self, days: u32) -> Result<u64, QueueError> {
        let workers = self.lock_workers().await;
        let deleted = self.inner.store.purge_tasks_older_than(days).await?;
        drop(workers);

        info!("Purged {} tasks older than {} days", deleted, days);
        self.inner.notifier.send(Change::Tasks);
        self.inner.notifier.send(Change::Events);
        Ok(deleted)
    }

    /// Delete events that occurred more than `days` ago.
    pub async fn purge_events_older_than(&self, days: u32) -> Result<u64, QueueError> {
        let workers = self.lock_workers().await;
        let deleted = self.inner.store.purge_events_older_than(days).await?;
        drop(workers);

        info!("Purged {} events older than {} days", deleted, days);
        self.inner.notifier.send(Change::Events);
        self.inner.notifier.send(Change::Tasks);
        Ok(deleted)
    }

    /// All tasks, newest first.
    pub async fn tasks(&self) -> Result<Vec<TaskInfo>, QueueError> {
        let rows = self.inner.store.tasks().await?;
        Ok(rows.into_iter().map(TaskInfo::from).collect())
    }

    /// A single task.
    pub async fn task(&self, id: TaskId) -> Result<Option<TaskInfo>, QueueError> {
        Ok(self.inner.store.task(id).await?.map(TaskInfo::from))
    }

    /// All events, oldest first.
    pub async fn events(&self) -> Result<Vec<Event>, QueueError> {
        let rows = self.inner.store.events().await?;
        Ok(rows.into_iter().map(Event::from_row).collect())
    }

    /// Events attached to a task, oldest first.
    pub async fn events_for_task(&self, task_id: TaskId) -> Result<Vec<Event>, QueueError> {
        let rows = self.inner.store.events_for_task(task_id).await?;
        Ok(rows.into_iter().map(Event::from_row).collect())
    }

    /// Names of all known queues.
    pub async fn queue_names(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.inner.store.queue_names().await?)
    }

    /// Names of queues with a live worker.
    pub async fn active_queues(&self) -> Vec<String> {
        let workers = self.lock_workers().await;
        let mut names: Vec<String> = workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ids of tasks currently being run, by queue.
    pub async fn running_tasks(&self) -> Vec<(String, TaskId)> {
        let workers = self.lock_workers().await;
        let mut running: Vec<_> = workers
            .iter()
            .filter_map(|(queue, entry)| entry.worker.current_task().map(|id| (queue.clone(), id)))
            .collect();
        running.sort();
        running
    }

    /// Subscribe to task and event changes.
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.inner.notifier.subscribe()
    }

    /// Stop all workers.
    ///
    /// Runs in progress are abandoned and their tasks stay queued, to be run
    /// again by the next manager started on the same store.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let entries: Vec<(String, WorkerEntry)> = {
            let mut workers = self.lock_workers().await;
            workers.drain().collect()
        };

        for (queue, entry) in entries {
            entry.handle.abort();
            if let Err(e) = entry.handle.await {
                if !e.is_cancelled() {
                    warn!("Queue '{}' worker ended abnormally: {}", queue, e);
                }
            }
            debug!("Queue '{}' worker stopped", queue);
        }
        info!("Queue manager stopped");
    }

    /// Whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// The underlying store.
    pub fn store(&self) -> &dyn TaskStore {
        self.inner.store.as_ref()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub(crate) fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub(crate) async fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        self.inner.workers.lock().await
    }

    fn cancel_running(workers: &Workers, id: TaskId) -> bool {
        workers
            .values()
            .any(|entry| entry.worker.cancel_if_running(id))
    }

    fn spawn_worker(&self, workers: &mut Workers, queue: &str) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let worker = Arc::new(QueueWorker::new(queue, generation));
        let handle = tokio::spawn(worker.clone().run(self.clone()));
        self.on_queue_starting(workers, WorkerEntry { worker, handle });
    }

    /// Register a newly started worker. Caller holds the manager lock.
    pub(crate) fn on_queue_starting(&self, workers: &mut Workers, entry: WorkerEntry) {
        info!(
            "Queue '{}' started (worker {})",
            entry.worker.queue(),
            entry.worker.generation()
        );
        workers.insert(entry.worker.queue().to_string(), entry);
    }

    /// Deregister a worker that is about to exit. Caller holds the manager lock.
    ///
    /// Only removes the entry when it still belongs to `worker`; returns
    /// whether it did.
    pub(crate) fn on_queue_terminating(&self, workers: &mut Workers, worker: &QueueWorker) -> bool {
        let same = workers
            .get(worker.queue())
            .is_some_and(|entry| entry.worker.generation() == worker.generation());
        if same {
            workers.remove(worker.queue());
            info!(
                "Queue '{}' stopped (worker {})",
                worker.queue(),
                worker.generation()
            );
        }
        same
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
