//! # TaskQueue Core
//!
//! Durable background task queue.
//!
//! ## Features
//!
//! - Named queues, each run by its own on-demand worker
//! - Priorities, retry backoff and a retry limit
//! - Versioned task encoding with a registry of task kinds
//! - Per-task events and change notification
//! - Cooperative cancellation

pub mod codec;
pub mod error;
pub mod event;
pub mod manager;
pub mod notify;
pub mod task;
mod worker;

pub use codec::{encode_task, TaskRegistry, UNREADABLE_TASK_DESCRIPTION};
pub use error::{CodecError, QueueError};
pub use event::Event;
pub use manager::{QueueManager, TaskInfo};
pub use notify::{Change, ChangeNotifier};
pub use task::{Task, TaskContext, TaskKind, TaskPayload};

pub use taskqueue_store::{EventId, TaskId, TaskStatus};
