    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::LazyLock;

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use taskqueue_store::{
        EventRow, MemoryTaskStore, NewEvent, RequeueOutcome, ScheduledTask, StoreError,
        RETRY_LIMIT_EXCEEDED,
    };
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    use crate::task::{TaskContext, TaskKind};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum Behaviour {
        Succeed,
        Requeue,
        RequeueOnce,
        Fail(String),
        Panic,
        Block,
        WaitForCancel,
        RecordEvent,
        ResetAndRequeue { until: usize },
        SaveThenBlock,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Scripted {
        key: String,
        behaviour: Behaviour,
        #[serde(default)]
        priority: i64,
        #[serde(default)]
        category: i64,
        #[serde(default)]
        delay_secs: u64,
        #[serde(default)]
        progress: u32,
    }

    impl Scripted {
        fn new(key: &str, behaviour: Behaviour) -> Self {
            Self {
                key: key.to_string(),
                behaviour,
                priority: 0,
                category: 0,
                delay_secs: 0,
                progress: 0,
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    struct Run {
        id: TaskId,
        retries: u32,
    }

    static RUNS: LazyLock<SyncMutex<HashMap<String, Vec<Run>>>> = LazyLock::new(Default::default);
    static GATES: LazyLock<SyncMutex<HashMap<String, Arc<Notify>>>> =
        LazyLock::new(Default::default);

    fn record(key: &str, ctx: &TaskContext) -> usize {
        let mut runs = RUNS.lock();
        let runs = runs.entry(key.to_string()).or_default();
        runs.push(Run {
            id: ctx.id(),
            retries: ctx.retries(),
        });
        runs.len()
    }

    fn runs(key: &str) -> Vec<Run> {
        RUNS.lock().get(key).cloned().unwrap_or_default()
    }

    fn gate(key: &str) -> Arc<Notify> {
        GATES.lock().entry(key.to_string()).or_default().clone()
    }

    fn open_gate(key: &str) {
        gate(key).notify_one();
    }

    impl TaskKind for Scripted {
        const KIND: &'static str = "scripted";
    }

    #[async_trait]
    impl Task for Scripted {
        fn description(&self) -> String {
            format!("{} step {}", self.key, self.progress)
        }

        fn category(&self) -> i64 {
            self.category
        }

        fn priority(&self) -> i64 {
            self.priority
        }

        fn retry_delay(&self, _retries: u32) -> Duration {
            Duration::from_secs(self.delay_secs)
        }

        async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<bool> {
            let run_number = record(&self.key, ctx);
            match self.behaviour.clone() {
                Behaviour::Succeed => Ok(true),
                Behaviour::Requeue => Ok(false),
                Behaviour::RequeueOnce => Ok(run_number > 1),
                Behaviour::Fail(message) => {
                    Err(anyhow::anyhow!(message).context("scripted failure"))
                }
                Behaviour::Panic => panic!("scripted panic"),
                Behaviour::Block => {
                    gate(&self.key).notified().await;
                    Ok(true)
                }
                Behaviour::WaitForCancel => {
                    ctx.cancelled().await;
                    Ok(true)
                }
                Behaviour::RecordEvent => {
                    let event = Event::new("progress", "halfway").with_data(json!({ "done": 50 }));
                    ctx.store_event(event).await?;
                    Ok(true)
                }
                Behaviour::ResetAndRequeue { until } => {
                    ctx.reset_retry_counter();
                    Ok(run_number >= until)
                }
                Behaviour::SaveThenBlock => {
                    self.progress += 1;
                    ctx.save_progress(&*self).await?;
                    gate(&self.key).notified().await;
                    Ok(true)
                }
            }
        }
    }

    fn manager_with(store: MemoryTaskStore) -> QueueManager {
        QueueManager::new(Arc::new(store), TaskRegistry::new().with::<Scripted>())
    }

    fn manager() -> QueueManager {
        manager_with(MemoryTaskStore::new())
    }

    /// Memory store whose next `mark_completed` stalls, then fails.
    struct FlakyStore {
        inner: MemoryTaskStore,
        fail_completion: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryTaskStore::new(),
                fail_completion: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        fn retry_limit(&self) -> u32 {
            self.inner.retry_limit()
        }

        async fn create_queue(&self, name: &str) -> Result<(), StoreError> {
            self.inner.create_queue(name).await
        }

        async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
            self.inner.queue_names().await
        }

        async fn queues_with_pending(&self) -> Result<Vec<String>, StoreError> {
            self.inner.queues_with_pending().await
        }

        async fn enqueue(&self, task: &NewTask, queue: &str) -> Result<TaskId, StoreError> {
            self.inner.enqueue(task, queue).await
        }

        async fn next_runnable(
            &self,
            queue: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<ScheduledTask>, StoreError> {
            self.inner.next_runnable(queue, now).await
        }

        async fn persist_progress(&self, snapshot: &TaskSnapshot) -> Result<(), StoreError> {
            self.inner.persist_progress(snapshot).await
        }

        async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
            if self.fail_completion.swap(false, Ordering::SeqCst) {
                sleep(Duration::from_millis(200)).await;
                return Err(StoreError::Database("disk I/O error".to_string()));
            }
            self.inner.mark_completed(id).await
        }

        async fn mark_failed(
            &self,
            snapshot: &TaskSnapshot,
            reason: &str,
        ) -> Result<(), StoreError> {
            self.inner.mark_failed(snapshot, reason).await
        }

        async fn requeue(&self, snapshot: &TaskSnapshot) -> Result<RequeueOutcome, StoreError> {
            self.inner.requeue(snapshot).await
        }

        async fn store_event(
            &self,
            task_id: TaskId,
            event: &NewEvent,
        ) -> Result<Option<EventId>, StoreError> {
            self.inner.store_event(task_id, event).await
        }

        async fn delete_task(&self, id: TaskId) -> Result<(), StoreError> {
            self.inner.delete_task(id).await
        }

        async fn delete_event(&self, id: EventId) -> Result<(), StoreError> {
            self.inner.delete_event(id).await
        }

        async fn has_active_tasks(&self, category: i64) -> Result<bool, StoreError> {
            self.inner.has_active_tasks(category).await
        }

        async fn purge_tasks_older_than(&self, days: u32) -> Result<u64, StoreError> {
            self.inner.purge_tasks_older_than(days).await
        }

        async fn purge_events_older_than(&self, days: u32) -> Result<u64, StoreError> {
            self.inner.purge_events_older_than(days).await
        }

        async fn tasks(&self) -> Result<Vec<TaskRow>, StoreError> {
            self.inner.tasks().await
        }

        async fn task(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError> {
            self.inner.task(id).await
        }

        async fn events(&self) -> Result<Vec<EventRow>, StoreError> {
            self.inner.events().await
        }

        async fn events_for_task(&self, task_id: TaskId) -> Result<Vec<EventRow>, StoreError> {
            self.inner.events_for_task(task_id).await
        }
    }

    async fn drained(manager: &QueueManager) {
        timeout(Duration::from_secs(10), async {
            while !manager.active_queues().await.is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queues did not drain");
    }

    async fn until_running(manager: &QueueManager, id: TaskId) {
        timeout(Duration::from_secs(10), async {
            while !manager.running_tasks().await.iter().any(|(_, t)| *t == id) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task did not start");
    }

    #[tokio::test]
    async fn test_successful_task_is_removed() {
        let manager = manager();
        let mut task = Scripted::new("success", Behaviour::Succeed);
        task.category = 11;

        let id = manager.enqueue_task("main", &task).await.unwrap();
        drained(&manager).await;

        assert_eq!(runs("success").len(), 1);
        assert_eq!(runs("success")[0].id, id);
        assert!(manager.task(id).await.unwrap().is_none());
        assert!(!manager.has_active_tasks(11).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_active_tasks_until_terminal() {
        let manager = manager();
        let mut task = Scripted::new("active", Behaviour::Block);
        task.category = 12;

        let id = manager.enqueue_task("main", &task).await.unwrap();
        until_running(&manager, id).await;
        assert!(manager.has_active_tasks(12).await.unwrap());

        open_gate("active");
        drained(&manager).await;
        assert!(!manager.has_active_tasks(12).await.unwrap());
    }

    #[tokio::test]
    async fn test_task_with_events_is_kept() {
        let manager = manager();
        let id = manager
            .enqueue_task("main", &Scripted::new("events", Behaviour::RecordEvent))
            .await
            .unwrap();
        drained(&manager).await;

        let info = manager.task(id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Completed);
        assert_eq!(info.event_count, 1);
        assert_eq!(info.description, "events step 0");

        let events = manager.events_for_task(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "progress");
        assert_eq!(events[0].data["done"], 50);

        // Deleting the last event removes the completed task
        manager.delete_event(events[0].id.unwrap()).await.unwrap();
        assert!(manager.task(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_always_requeued_task_fails_at_retry_limit() {
        let manager = manager_with(MemoryTaskStore::new().with_retry_limit(3));
        let id = manager
            .enqueue_task("main", &Scripted::new("limit", Behaviour::Requeue))
            .await
            .unwrap();
        drained(&manager).await;

        let retries: Vec<u32> = runs("limit").iter().map(|r| r.retries).collect();
        assert_eq!(retries, vec![0, 1, 2, 3]);

        let info = manager.task(id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert_eq!(info.failure_reason.as_deref(), Some(RETRY_LIMIT_EXCEEDED));
        assert_eq!(info.retries, 3);
    }

    #[tokio::test]
    async fn test_reset_retry_counter() {
        let manager = manager_with(MemoryTaskStore::new().with_retry_limit(2));
        let id = manager
            .enqueue_task(
                "main",
                &Scripted::new("reset", Behaviour::ResetAndRequeue { until: 5 }),
            )
            .await
            .unwrap();
        drained(&manager).await;

        assert_eq!(runs("reset").len(), 5);
        assert!(runs("reset").iter().all(|r| r.retries <= 1));
        assert!(manager.task(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_marks_task_failed() {
        let manager = manager();
        let id = manager
            .enqueue_task(
                "main",
                &Scripted::new("error", Behaviour::Fail("disk full".to_string())),
            )
            .await
            .unwrap();
        drained(&manager).await;

        let info = manager.task(id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert_eq!(info.failure_reason.as_deref(), Some("scripted failure"));
        assert_eq!(
            info.exception.as_deref(),
            Some("scripted failure: disk full")
        );
        assert_eq!(runs("error").len(), 1);
    }

    #[tokio::test]
    async fn test_panic_marks_task_failed() {
        let manager = manager();
        let id = manager
            .enqueue_task("main", &Scripted::new("panic", Behaviour::Panic))
            .await
            .unwrap();
        let ok = manager
            .enqueue_task("main", &Scripted::new("after-panic", Behaviour::Succeed))
            .await
            .unwrap();
        drained(&manager).await;

        let info = manager.task(id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert_eq!(info.failure_reason.as_deref(), Some("panic: scripted panic"));

        // The worker survives and runs the next task
        assert_eq!(runs("after-panic").len(), 1);
        assert!(manager.task(ok).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_order() {
        let manager = manager();
        let blocker = manager
            .enqueue_task("main", &Scripted::new("prio-gate", Behaviour::Block))
            .await
            .unwrap();
        until_running(&manager, blocker).await;

        let mut ids = HashMap::new();
        for priority in [5, 1, 3] {
            let mut task = Scripted::new("prio", Behaviour::Succeed);
            task.priority = priority;
            ids.insert(manager.enqueue_task("main", &task).await.unwrap(), priority);
        }

        open_gate("prio-gate");
        drained(&manager).await;

        let order: Vec<i64> = runs("prio").iter().map(|r| ids[&r.id]).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_queues_run_independently() {
        let manager = manager();
        let blocked = manager
            .enqueue_task("main", &Scripted::new("indep-gate", Behaviour::Block))
            .await
            .unwrap();
        until_running(&manager, blocked).await;

        manager
            .enqueue_task("small_jobs", &Scripted::new("indep", Behaviour::Succeed))
            .await
            .unwrap();
        timeout(Duration::from_secs(10), async {
            while runs("indep").is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("small_jobs did not run");

        assert_eq!(manager.active_queues().await, vec!["main"]);
        open_gate("indep-gate");
        drained(&manager).await;
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiting_worker() {
        let manager = manager();
        let mut waiting = Scripted::new("wake-a", Behaviour::RequeueOnce);
        waiting.delay_secs = 3600;
        manager.enqueue_task("main", &waiting).await.unwrap();

        timeout(Duration::from_secs(10), async {
            while runs("wake-a").is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager
            .enqueue_task("main", &Scripted::new("wake-b", Behaviour::Succeed))
            .await
            .unwrap();
        timeout(Duration::from_secs(10), async {
            while runs("wake-b").is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("waiting worker was not woken");

        // Still waiting for the first task's retry time
        assert_eq!(manager.active_queues().await, vec!["main"]);
        assert_eq!(runs("wake-a").len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_running_task_deletes_it() {
        let manager = manager();
        let id = manager
            .enqueue_task("main", &Scripted::new("cancel", Behaviour::WaitForCancel))
            .await
            .unwrap();
        until_running(&manager, id).await;

        assert!(!manager.cancel(id + 1000).await);
        assert!(manager.cancel(id).await);
        drained(&manager).await;

        assert!(manager.task(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_running_task_cancels_it() {
        let manager = manager();
        let id = manager
            .enqueue_task("main", &Scripted::new("delete", Behaviour::WaitForCancel))
            .await
            .unwrap();
        until_running(&manager, id).await;

        manager.delete_task(id).await.unwrap();
        drained(&manager).await;

        assert!(manager.task(id).await.unwrap().is_none());
        assert_eq!(runs("delete").len(), 1);
    }

    #[tokio::test]
    async fn test_save_progress_is_visible_while_running() {
        let manager = manager();
        let id = manager
            .enqueue_task("main", &Scripted::new("progress", Behaviour::SaveThenBlock))
            .await
            .unwrap();
        until_running(&manager, id).await;

        timeout(Duration::from_secs(10), async {
            loop {
                let info = manager.task(id).await.unwrap().unwrap();
                if info.description == "progress step 1" {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("progress was not saved");

        open_gate("progress");
        drained(&manager).await;
    }

    #[tokio::test]
    async fn test_shutdown_leaves_running_task_queued() {
        let manager = manager();
        let id = manager
            .enqueue_task("main", &Scripted::new("shutdown", Behaviour::Block))
            .await
            .unwrap();
        until_running(&manager, id).await;

        manager.shutdown().await;
        assert!(manager.is_shut_down());
        assert!(manager.active_queues().await.is_empty());

        let info = manager.task(id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Queued);
        assert_eq!(info.retries, 0);

        let err = manager
            .enqueue_task("main", &Scripted::new("shutdown", Behaviour::Succeed))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let manager = manager();
        let mut rx = manager.subscribe();

        manager
            .enqueue_task("main", &Scripted::new("notify", Behaviour::RecordEvent))
            .await
            .unwrap();
        drained(&manager).await;

        let mut seen = Vec::new();
        while let Ok(change) = rx.try_recv() {
            seen.push(change);
        }
        assert!(seen.contains(&Change::Tasks));
        assert!(seen.contains(&Change::Events));
    }

    #[tokio::test]
    async fn test_unreadable_task_listing_and_queue_stop() {
        let manager = manager();
        manager.store().create_queue("legacy").await.unwrap();
        let id = manager
            .store()
            .enqueue(
                &NewTask {
                    category: 0,
                    priority: 0,
                    payload: b"\x00garbage".to_vec(),
                },
                "legacy",
            )
            .await
            .unwrap();

        let tasks = manager.tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, UNREADABLE_TASK_DESCRIPTION);
        assert!(!tasks[0].readable);

        assert_eq!(manager.resume().await.unwrap(), vec!["legacy"]);
        drained(&manager).await;

        // The undecodable task stays queued
        let info = manager.task(id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_store_event_for_missing_task() {
        let manager = manager();
        let id = manager
            .store_task_event(999, Event::new("note", "nobody home"))
            .await
            .unwrap();
        assert!(id.is_none());
        assert!(manager.events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_creates_configured_queues() {
        let config = Config::default();
        let manager = QueueManager::start(
            &config,
            Arc::new(MemoryTaskStore::new()),
            TaskRegistry::new().with::<Scripted>(),
        )
        .await
        .unwrap();

        assert_eq!(
            manager.queue_names().await.unwrap(),
            vec!["main", "small_jobs"]
        );
        assert!(manager.active_queues().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminating_ignores_stale_worker() {
        let manager = manager();
        let mut workers = manager.lock_workers().await;

        let stale = QueueWorker::new("main", 1);
        let current = Arc::new(QueueWorker::new("main", 2));
        manager.on_queue_starting(
            &mut workers,
            WorkerEntry {
                worker: current.clone(),
                handle: tokio::spawn(async {}),
            },
        );

        assert!(!manager.on_queue_terminating(&mut workers, &stale));
        assert!(workers.contains_key("main"));
        assert!(manager.on_queue_terminating(&mut workers, &current));
        assert!(workers.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_store_fault_restarts_queue() {
        let manager = QueueManager::new(
            Arc::new(FlakyStore::new()),
            TaskRegistry::new().with::<Scripted>(),
        );

        let first = manager
            .enqueue_task("main", &Scripted::new("fault_first", Behaviour::Succeed))
            .await
            .unwrap();
        // Lands while the worker is stuck recording the first outcome
        sleep(Duration::from_millis(50)).await;
        let second = manager
            .enqueue_task("main", &Scripted::new("fault_second", Behaviour::Succeed))
            .await
            .unwrap();
        drained(&manager).await;

        assert_eq!(runs("fault_second").len(), 1);
        assert!(manager.task(second).await.unwrap().is_none());
        // The first task's outcome was lost, so it runs again
        assert_eq!(runs("fault_first").len(), 2);
        assert!(manager.task(first).await.unwrap().is_none());
        assert!(manager.tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_uses_store_retry_limit() {
        let config = Config::default();
        let manager = QueueManager::start(
            &config,
            Arc::new(MemoryTaskStore::new().with_retry_limit(3)),
            TaskRegistry::new().with::<Scripted>(),
        )
        .await
        .unwrap();
        assert_eq!(manager.store().retry_limit(), 3);

        let id = manager
            .enqueue_task("main", &Scripted::new("store_limit", Behaviour::Requeue))
            .await
            .unwrap();
        drained(&manager).await;

        let info = manager.task(id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Failed);
        assert_eq!(info.retries, 3);
    }
