//! Database schema management.

use rusqlite::Connection;
use tokio_rusqlite::Error;

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = r#"
-- Named queues
CREATE TABLE IF NOT EXISTS queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Tasks; payload is the encoded task envelope
CREATE TABLE IF NOT EXISTS task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id INTEGER NOT NULL REFERENCES queue(id),
    queued_at TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status_code TEXT NOT NULL DEFAULT 'Q',
    category INTEGER NOT NULL,
    retry_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT,
    exception TEXT,
    payload BLOB NOT NULL
);

-- Per-task diagnostics
CREATE TABLE IF NOT EXISTS event (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER REFERENCES task(id),
    payload BLOB NOT NULL,
    occurred_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_queue_status ON task(queue_id, status_code, retry_at);
CREATE INDEX IF NOT EXISTS idx_task_category ON task(category, status_code);
CREATE INDEX IF NOT EXISTS idx_event_task ON event(task_id);
CREATE INDEX IF NOT EXISTS idx_event_occurred ON event(occurred_at);
"#;
