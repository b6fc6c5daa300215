//! # TaskQueue Store
//!
//! Persistence layer for the task queue.
//!
//! ## Features
//!
//! - Named queues, tasks and events in SQLite
//! - Two-phase "next runnable task" lookup
//! - Requeue with retry limit, completion and failure bookkeeping
//! - Orphan cleanup and age-based retention
//! - In-memory store with identical semantics for tests

pub mod error;
pub mod memory;
pub mod record;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryTaskStore;
pub use record::{
    EventId, EventRow, NewEvent, NewTask, RequeueOutcome, ScheduledTask, TaskId, TaskRow,
    TaskSnapshot, TaskStatus, DEFAULT_RETRY_LIMIT, RETRY_LIMIT_EXCEEDED,
};
pub use sqlite::SqliteTaskStore;
pub use store::TaskStore;
