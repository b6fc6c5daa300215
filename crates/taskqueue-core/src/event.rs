//! Task events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskqueue_store::{EventId, EventRow, NewEvent, TaskId};
use tracing::warn;

use crate::error::CodecError;

/// Kind given to events whose stored form cannot be read.
pub const UNREADABLE_EVENT_KIND: &str = "legacy";

/// Description given to events whose stored form cannot be read.
pub const UNREADABLE_EVENT_DESCRIPTION: &str = "Legacy or corrupt event record";

/// A diagnostic record attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the store; `None` until saved.
    #[serde(skip)]
    pub id: Option<EventId>,

    #[serde(skip)]
    pub task_id: Option<TaskId>,

    /// Short machine-readable category, e.g. `"progress"`.
    pub kind: String,

    pub description: String,

    #[serde(default)]
    pub data: Value,

    #[serde(skip, default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event.
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: None,
            task_id: None,
            kind: kind.into(),
            description: description.into(),
            data: Value::Null,
            occurred_at: Utc::now(),
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attach any serializable value as data.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, CodecError> {
        self.data = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Read the data back as a typed value.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Placeholder for a stored event that could not be decoded.
    pub fn unreadable(id: EventId, task_id: Option<TaskId>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Some(id),
            task_id,
            kind: UNREADABLE_EVENT_KIND.to_string(),
            description: UNREADABLE_EVENT_DESCRIPTION.to_string(),
            data: Value::Null,
            occurred_at,
        }
    }

    /// Whether this is a placeholder for an undecodable record.
    pub fn is_unreadable(&self) -> bool {
        self.kind == UNREADABLE_EVENT_KIND && self.description == UNREADABLE_EVENT_DESCRIPTION
    }

    pub(crate) fn encode(&self) -> Result<NewEvent, CodecError> {
        Ok(NewEvent {
            payload: serde_json::to_vec(self)?,
        })
    }

    /// Decode a stored event, substituting a placeholder when it is unreadable.
    pub(crate) fn from_row(row: EventRow) -> Self {
        match serde_json::from_slice::<Event>(&row.payload) {
            Ok(mut event) => {
                event.id = Some(row.id);
                event.task_id = row.task_id;
                event.occurred_at = row.occurred_at;
                event
            }
            Err(e) => {
                warn!("Event {} is unreadable: {}", row.id, e);
                Self::unreadable(row.id, row.task_id, row.occurred_at)
            }
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            self.description
        )
    }
}
