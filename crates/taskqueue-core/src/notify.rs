//! Change notification for task and event listings.

use std::fmt;

use tokio::sync::broadcast;
use tracing::trace;

/// What changed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Tasks were added, updated, finished or removed.
    Tasks,
    /// Events were added or removed.
    Events,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Tasks => write!(f, "TASKS"),
            Change::Events => write!(f, "EVENTS"),
        }
    }
}

/// Fans out change notifications to any number of listeners.
///
/// Sending never blocks; listeners that fall behind observe
/// `RecvError::Lagged` and should reload their view.
#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<Change>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to changes.
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.sender.subscribe()
    }

    /// Notify listeners of a change.
    pub fn send(&self, change: Change) {
        trace!("Change: {}", change);
        // No listeners is fine
        let _ = self.sender.send(change);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}
