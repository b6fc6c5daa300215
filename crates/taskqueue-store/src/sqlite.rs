//! SQLite task record store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;
use crate::record::{
    add_delay, cutoff, format_timestamp, parse_timestamp, wait_until, EventId, EventRow,
    NewEvent, NewTask, RequeueOutcome, ScheduledTask, TaskId, TaskRow, TaskSnapshot, TaskStatus,
    DEFAULT_RETRY_LIMIT, RETRY_LIMIT_EXCEEDED,
};
use crate::schema::init_schema;
use crate::store::TaskStore;

const SQL_NEXT_TASK_BASE: &str = "SELECT t.id, t.payload, t.retry_count, t.retry_at
     FROM queue q JOIN task t ON t.queue_id = q.id
     WHERE t.status_code = 'Q' AND q.name = ?1";

/// Highest priority task that can run now.
const SQL_TASK_RUNNABLE_NOW: &str = "AND t.retry_at <= ?2
     ORDER BY t.priority, t.retry_at, t.id LIMIT 1";

/// First task that is waiting to run.
const SQL_TASK_WAITING: &str = "AND t.retry_at > ?2
     ORDER BY t.retry_at, t.priority, t.id LIMIT 1";

const SQL_MARK_FAILED: &str = "UPDATE task SET
        status_code = 'F',
        failure_reason = ?1,
        payload = COALESCE(?2, payload),
        category = ?3,
        exception = COALESCE(?4, exception)
     WHERE id = ?5";

/// Events whose task is gone.
const SQL_DELETE_ORPHANED_EVENTS: &str = "DELETE FROM event
     WHERE task_id IS NOT NULL
       AND NOT EXISTS (SELECT 1 FROM task t WHERE t.id = event.task_id)";

/// Successful tasks with nothing left to show.
const SQL_DELETE_COMPLETED_TASKS: &str = "DELETE FROM task
     WHERE status_code = 'S'
       AND NOT EXISTS (SELECT 1 FROM event e WHERE e.task_id = task.id)";

const SQL_SELECT_TASKS: &str = "SELECT t.id, q.name, t.status_code, t.category, t.priority,
        t.retry_count, t.queued_at, t.retry_at, t.failure_reason, t.exception, t.payload,
        (SELECT COUNT(*) FROM event e WHERE e.task_id = t.id) AS event_count
     FROM task t JOIN queue q ON q.id = t.queue_id";

const SQL_SELECT_EVENTS: &str = "SELECT id, task_id, payload, occurred_at FROM event";

/// SQLite-based task record store.
pub struct SqliteTaskStore {
    conn: Connection,
    retry_limit: u32,
}

impl SqliteTaskStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    /// Open (or create) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Database(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(&path).await?;
        debug!("SqliteTaskStore opened at {:?}", path);
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| Ok(init_schema(conn)?)).await?;
        Ok(Self {
            conn,
            retry_limit: DEFAULT_RETRY_LIMIT,
        })
    }

    /// Set the number of requeues allowed before a task fails.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }
}

fn queue_id(conn: &rusqlite::Connection, name: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT id FROM queue WHERE name = ?1", [name], |row| row.get(0))
        .optional()
}

fn mark_failed_in(
    conn: &rusqlite::Connection,
    snapshot: &TaskSnapshot,
    reason: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        SQL_MARK_FAILED,
        params![
            reason,
            snapshot.payload,
            snapshot.category,
            snapshot.exception,
            snapshot.id
        ],
    )
}

/// Remove orphaned events and eventless completed tasks.
///
/// Must run inside the caller's transaction.
fn cleanup_orphans(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute(SQL_DELETE_ORPHANED_EVENTS, [])?;
    tx.execute(SQL_DELETE_COMPLETED_TASKS, [])?;
    Ok(())
}

/// Task row as read from SQLite, before timestamp and status parsing.
struct RawTask {
    id: TaskId,
    queue: String,
    status_code: String,
    category: i64,
    priority: i64,
    retry_count: i64,
    queued_at: String,
    retry_at: String,
    failure_reason: Option<String>,
    exception: Option<String>,
    payload: Vec<u8>,
    event_count: i64,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            queue: row.get(1)?,
            status_code: row.get(2)?,
            category: row.get(3)?,
            priority: row.get(4)?,
            retry_count: row.get(5)?,
            queued_at: row.get(6)?,
            retry_at: row.get(7)?,
            failure_reason: row.get(8)?,
            exception: row.get(9)?,
            payload: row.get(10)?,
            event_count: row.get(11)?,
        })
    }

    fn into_row(self) -> Result<TaskRow, StoreError> {
        Ok(TaskRow {
            id: self.id,
            queue: self.queue,
            status: TaskStatus::from_code(&self.status_code)?,
            category: self.category,
            priority: self.priority,
            retries: retry_count(self.retry_count)?,
            queued_at: parse_timestamp(&self.queued_at)?,
            retry_at: parse_timestamp(&self.retry_at)?,
            failure_reason: self.failure_reason,
            exception: self.exception,
            payload: self.payload,
            event_count: u64::try_from(self.event_count).unwrap_or_default(),
        })
    }
}

struct RawEvent {
    id: EventId,
    task_id: Option<TaskId>,
    payload: Vec<u8>,
    occurred_at: String,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            payload: row.get(2)?,
            occurred_at: row.get(3)?,
        })
    }

    fn into_row(self) -> Result<EventRow, StoreError> {
        Ok(EventRow {
            id: self.id,
            task_id: self.task_id,
            payload: self.payload,
            occurred_at: parse_timestamp(&self.occurred_at)?,
        })
    }
}

fn retry_count(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("retry count {} out of range", value)))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    async fn create_queue(&self, name: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("INSERT OR IGNORE INTO queue (name) VALUES (?1)", [&name])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let names = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT name FROM queue ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await?;
        Ok(names)
    }

    async fn queues_with_pending(&self) -> Result<Vec<String>, StoreError> {
        let names = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT q.name FROM queue q JOIN task t ON t.queue_id = q.id
                     WHERE t.status_code = 'Q' ORDER BY q.name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await?;
        Ok(names)
    }

    async fn enqueue(&self, task: &NewTask, queue: &str) -> Result<TaskId, StoreError> {
        let task = task.clone();
        let queue = queue.to_string();
        let now = format_timestamp(Utc::now());

        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let queue_id = queue_id(&tx, &queue)?
                    .ok_or_else(|| StoreError::QueueNotFound(queue.clone()))?;
                tx.execute(
                    "INSERT INTO task (queue_id, queued_at, priority, status_code, category,
                                       retry_at, retry_count, payload)
                     VALUES (?1, ?2, ?3, 'Q', ?4, ?2, 0, ?5)",
                    params![queue_id, now, task.priority, task.category, task.payload],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await?;

        debug!("Enqueued task {}", id);
        Ok(id)
    }

    async fn next_runnable(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledTask>, StoreError> {
        let queue = queue.to_string();
        let now_text = format_timestamp(now);

        let found = self
            .conn
            .call(move |conn| {
                let map = |row: &Row<'_>| {
                    Ok((
                        row.get::<_, TaskId>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                };

                let runnable_now = format!("{} {}", SQL_NEXT_TASK_BASE, SQL_TASK_RUNNABLE_NOW);
                let found = conn
                    .query_row(&runnable_now, params![queue, now_text], map)
                    .optional()?;
                if found.is_some() {
                    return Ok(found);
                }

                let waiting = format!("{} {}", SQL_NEXT_TASK_BASE, SQL_TASK_WAITING);
                Ok(conn
                    .query_row(&waiting, params![queue, now_text], map)
                    .optional()?)
            })
            .await?;

        let Some((id, payload, retries, retry_at)) = found else {
            return Ok(None);
        };

        Ok(Some(ScheduledTask {
            id,
            payload,
            retries: retry_count(retries)?,
            wait: wait_until(now, parse_timestamp(&retry_at)?),
        }))
    }

    async fn persist_progress(&self, snapshot: &TaskSnapshot) -> Result<(), StoreError> {
        let snapshot = snapshot.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE task SET payload = COALESCE(?1, payload), category = ?2 WHERE id = ?3",
                    params![snapshot.payload, snapshot.category, snapshot.id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let events: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM event WHERE task_id = ?1",
                    [id],
                    |row| row.get(0),
                )?;
                if events > 0 {
                    tx.execute("UPDATE task SET status_code = 'S' WHERE id = ?1", [id])?;
                } else {
                    tx.execute("DELETE FROM task WHERE id = ?1", [id])?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!("Task {} completed", id);
        Ok(())
    }

    async fn mark_failed(&self, snapshot: &TaskSnapshot, reason: &str) -> Result<(), StoreError> {
        let snapshot = snapshot.clone();
        let reason = reason.to_string();
        self.conn
            .call(move |conn| {
                mark_failed_in(conn, &snapshot, &reason)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn requeue(&self, snapshot: &TaskSnapshot) -> Result<RequeueOutcome, StoreError> {
        let snapshot = snapshot.clone();
        let limit = self.retry_limit;
        let retry_at = add_delay(Utc::now(), snapshot.retry_delay);
        let retry_at_text = format_timestamp(retry_at);

        let outcome = self
            .conn
            .call(move |conn| {
                if snapshot.retries >= limit {
                    mark_failed_in(conn, &snapshot, RETRY_LIMIT_EXCEEDED)?;
                    return Ok(RequeueOutcome::RetryLimitExceeded);
                }

                conn.execute(
                    "UPDATE task SET
                        retry_at = ?1,
                        retry_count = ?2,
                        payload = COALESCE(?3, payload),
                        category = ?4,
                        exception = COALESCE(?5, exception)
                     WHERE id = ?6",
                    params![
                        retry_at_text,
                        snapshot.retries.saturating_add(1),
                        snapshot.payload,
                        snapshot.category,
                        snapshot.exception,
                        snapshot.id
                    ],
                )?;
                Ok(RequeueOutcome::Requeued { retry_at })
            })
            .await?;
        Ok(outcome)
    }

    async fn store_event(
        &self,
        task_id: TaskId,
        event: &NewEvent,
    ) -> Result<Option<EventId>, StoreError> {
        let payload = event.payload.clone();
        let now = format_timestamp(Utc::now());

        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM task WHERE id = ?1)",
                    [task_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(None);
                }
                tx.execute(
                    "INSERT INTO event (task_id, payload, occurred_at) VALUES (?1, ?2, ?3)",
                    params![task_id, payload, now],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(Some(id))
            })
            .await?;

        if id.is_none() {
            debug!("Dropped event for deleted task {}", task_id);
        }
        Ok(id)
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM event WHERE task_id = ?1", [id])?;
                tx.execute("DELETE FROM task WHERE id = ?1", [id])?;
                cleanup_orphans(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!("Deleted task {}", id);
        Ok(())
    }

    async fn delete_event(&self, id: EventId) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM event WHERE id = ?1", [id])?;
                cleanup_orphans(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn has_active_tasks(&self, category: i64) -> Result<bool, StoreError> {
        let active = self
            .conn
            .call(move |conn| {
                let active: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM task
                     WHERE category = ?1 AND status_code NOT IN ('S', 'F'))",
                    [category],
                    |row| row.get(0),
                )?;
                Ok(active)
            })
            .await?;
        Ok(active)
    }

    async fn purge_tasks_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = format_timestamp(cutoff(Utc::now(), days));
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM event WHERE task_id IN
                        (SELECT id FROM task WHERE retry_at < ?1)",
                    [&cutoff],
                )?;
                let deleted = tx.execute("DELETE FROM task WHERE retry_at < ?1", [&cutoff])?;
                cleanup_orphans(&tx)?;
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        debug!("Purged {} tasks older than {} days", deleted, days);
        Ok(deleted as u64)
    }

    async fn purge_events_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = format_timestamp(cutoff(Utc::now(), days));
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx.execute("DELETE FROM event WHERE occurred_at < ?1", [&cutoff])?;
                cleanup_orphans(&tx)?;
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        debug!("Purged {} events older than {} days", deleted, days);
        Ok(deleted as u64)
    }

    async fn tasks(&self) -> Result<Vec<TaskRow>, StoreError> {
        let raw = self
            .conn
            .call(|conn| {
                let sql = format!("{} ORDER BY t.id DESC", SQL_SELECT_TASKS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], RawTask::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        raw.into_iter().map(RawTask::into_row).collect()
    }

    async fn task(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError> {
        let raw = self
            .conn
            .call(move |conn| {
                let sql = format!("{} WHERE t.id = ?1", SQL_SELECT_TASKS);
                Ok(conn.query_row(&sql, [id], RawTask::from_row).optional()?)
            })
            .await?;
        raw.map(RawTask::into_row).transpose()
    }

    async fn events(&self) -> Result<Vec<EventRow>, StoreError> {
        let raw = self
            .conn
            .call(|conn| {
                let sql = format!("{} ORDER BY id", SQL_SELECT_EVENTS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], RawEvent::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        raw.into_iter().map(RawEvent::into_row).collect()
    }

    async fn events_for_task(&self, task_id: TaskId) -> Result<Vec<EventRow>, StoreError> {
        let raw = self
            .conn
            .call(move |conn| {
                let sql = format!("{} WHERE task_id = ?1 ORDER BY id", SQL_SELECT_EVENTS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([task_id], RawEvent::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        raw.into_iter().map(RawEvent::into_row).collect()
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
