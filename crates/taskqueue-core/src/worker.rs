//! Per-queue worker.
//!
//! Each active queue has one worker running its tasks one at a time. The
//! worker holds the manager lock while choosing a task and while recording
//! its outcome, and releases it while the task runs.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use taskqueue_store::{
    RequeueOutcome, ScheduledTask, StoreError, TaskId, TaskSnapshot, TaskStore,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::codec::encode_task;
use crate::error::QueueError;
use crate::manager::QueueManager;
use crate::notify::Change;
use crate::task::{Task, TaskContext};

struct RunningTask {
    id: TaskId,
    token: CancellationToken,
}

/// Worker state shared with the manager.
pub(crate) struct QueueWorker {
    queue: String,
    generation: u64,
    wake: Notify,
    current: Mutex<Option<RunningTask>>,
}

/// What the worker does after a step.
enum Step {
    Continue,
    Stop,
}

impl QueueWorker {
    pub(crate) fn new(queue: impl Into<String>, generation: u64) -> Self {
        Self {
            queue: queue.into(),
            generation,
            wake: Notify::new(),
            current: Mutex::new(None),
        }
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Interrupt a wait for a task's retry time.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Id of the task being run, if any.
    pub(crate) fn current_task(&self) -> Option<TaskId> {
        self.current.lock().as_ref().map(|t| t.id)
    }

    /// Request cancellation of the task if this worker is running it.
    pub(crate) fn cancel_if_running(&self, id: TaskId) -> bool {
        match self.current.lock().as_ref() {
            Some(running) if running.id == id => {
                running.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Worker loop; returns when the queue is drained or the manager stops.
    pub(crate) async fn run(self: Arc<Self>, manager: QueueManager) {
        debug!("Queue '{}' worker {} running", self.queue, self.generation);

        loop {
            match self.step(&manager).await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Err(e) => {
                    error!("Queue '{}' stopped on storage error: {}", self.queue, e);
                    break;
                }
            }
        }
    }

    /// Poll the queue and run at most one task.
    ///
    /// A store failure deregisters the worker before the manager lock is
    /// released, so the next enqueue starts a fresh worker.
    async fn step(&self, manager: &QueueManager) -> Result<Step, QueueError> {
        let mut workers = manager.lock_workers().await;
        if manager.is_shut_down() {
            return Ok(Step::Stop);
        }

        let next = match manager.store().next_runnable(&self.queue, Utc::now()).await {
            Ok(Some(next)) => next,
            Ok(None) => {
                manager.on_queue_terminating(&mut workers, self);
                return Ok(Step::Stop);
            }
            Err(e) => {
                manager.on_queue_terminating(&mut workers, self);
                return Err(e.into());
            }
        };

        if !next.is_runnable() {
            drop(workers);
            debug!(
                "Queue '{}' waiting {:?} for task {}",
                self.queue, next.wait, next.id
            );
            tokio::select! {
                _ = tokio::time::sleep(next.wait) => {}
                _ = self.wake.notified() => {}
                _ = manager.shutdown_token().cancelled() => return Ok(Step::Stop),
            }
            return Ok(Step::Continue);
        }

        let mut task = match manager.registry().decode(&next.payload) {
            Ok(task) => task,
            Err(e) => {
                warn!(
                    "Task {} in queue '{}' cannot be decoded, stopping queue: {}",
                    next.id, self.queue, e
                );
                manager.on_queue_terminating(&mut workers, self);
                return Ok(Step::Stop);
            }
        };

        let token = CancellationToken::new();
        *self.current.lock() = Some(RunningTask {
            id: next.id,
            token: token.clone(),
        });
        drop(workers);

        let ctx = TaskContext::new(
            next.id,
            self.queue.as_str(),
            next.retries,
            token.clone(),
            manager.clone(),
        );
        let span = info_span!("task", id = next.id, queue = %self.queue);
        debug!(parent: &span, "Running task: {}", task.description());
        let result = AssertUnwindSafe(task.run(&ctx))
            .catch_unwind()
            .instrument(span)
            .await;

        let mut workers = manager.lock_workers().await;
        self.current.lock().take();

        let outcome = if token.is_cancelled() {
            Outcome::Cancelled
        } else {
            match result {
                Ok(Ok(true)) => Outcome::Completed,
                Ok(Ok(false)) => Outcome::Requeue {
                    retries_reset: ctx.retries_reset(),
                },
                Ok(Err(e)) => Outcome::Failed(e),
                Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
            }
        };

        if let Err(e) = record_outcome(manager.store(), &next, task.as_ref(), outcome).await {
            manager.on_queue_terminating(&mut workers, self);
            return Err(e.into());
        }
        drop(workers);

        manager.notifier().send(Change::Tasks);
        Ok(Step::Continue)
    }
}

/// How a run ended.
enum Outcome {
    Cancelled,
    Completed,
    Requeue { retries_reset: bool },
    Failed(anyhow::Error),
    Panicked(String),
}

/// Write a run's outcome back to the store. Caller holds the manager lock.
async fn record_outcome(
    store: &dyn TaskStore,
    next: &ScheduledTask,
    task: &dyn Task,
    outcome: Outcome,
) -> Result<(), StoreError> {
    match outcome {
        Outcome::Cancelled => {
            info!("Task {} cancelled, deleting", next.id);
            store.delete_task(next.id).await
        }
        Outcome::Completed => {
            debug!("Task {} completed", next.id);
            store.mark_completed(next.id).await
        }
        Outcome::Requeue { retries_reset } => {
            let retries = if retries_reset { 0 } else { next.retries };
            let snapshot = snapshot(next.id, task, retries, true, None);
            match store.requeue(&snapshot).await? {
                RequeueOutcome::Requeued { retry_at } => {
                    debug!("Task {} requeued until {}", next.id, retry_at);
                }
                RequeueOutcome::RetryLimitExceeded => {
                    warn!("Task {} failed: retry limit exceeded", next.id);
                }
            }
            Ok(())
        }
        Outcome::Failed(e) => {
            warn!("Task {} failed: {:#}", next.id, e);
            let snapshot = snapshot(next.id, task, next.retries, true, Some(format!("{:#}", e)));
            store.mark_failed(&snapshot, &e.to_string()).await
        }
        Outcome::Panicked(message) => {
            warn!("Task {} panicked: {}", next.id, message);
            // State after a panic is unknown; keep the stored payload
            let snapshot = snapshot(next.id, task, next.retries, false, Some(message.clone()));
            store.mark_failed(&snapshot, &message).await
        }
    }
}

/// Capture a task's state for writing back to the store.
fn snapshot(
    id: TaskId,
    task: &dyn Task,
    retries: u32,
    with_payload: bool,
    exception: Option<String>,
) -> TaskSnapshot {
    let payload = if with_payload {
        match encode_task(task) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Task {} state cannot be encoded, keeping previous: {}", id, e);
                None
            }
        }
    } else {
        None
    };

    TaskSnapshot {
        id,
        category: task.category(),
        payload,
        retries,
        retry_delay: task.retry_delay(retries),
        exception,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
