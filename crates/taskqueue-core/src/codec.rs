//! Task encoding and the registry of decodable task kinds.
//!
//! Tasks are stored as a JSON envelope:
//!
//! ```json
//! {"kind": "reindex", "version": 1, "description": "Reindex /photos", "data": {...}}
//! ```
//!
//! The description is stored alongside the data so listings can show it
//! without a registered decoder.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::task::{Task, TaskKind};

/// Description shown for a stored task whose envelope cannot be read.
pub const UNREADABLE_TASK_DESCRIPTION: &str = "Unreadable task";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    version: u32,
    #[serde(default)]
    description: String,
    #[serde(default)]
    data: Value,
}

/// Encode a task into its stored form.
pub fn encode_task(task: &dyn Task) -> Result<Vec<u8>, CodecError> {
    let envelope = Envelope {
        kind: task.kind().to_string(),
        version: task.version(),
        description: task.description(),
        data: task.to_data()?,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Read the description of a stored task without decoding it.
pub fn stored_description(bytes: &[u8]) -> Result<String, CodecError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    Ok(envelope.description)
}

type Decoder = fn(u32, Value) -> Result<Box<dyn Task>, CodecError>;

fn decode_kind<T: Task + TaskKind>(version: u32, data: Value) -> Result<Box<dyn Task>, CodecError> {
    let data = match version.cmp(&T::VERSION) {
        Ordering::Equal => data,
        Ordering::Less => T::upgrade(version, data)?,
        Ordering::Greater => {
            return Err(CodecError::UnsupportedVersion {
                kind: T::KIND.to_string(),
                found: version,
                supported: T::VERSION,
            });
        }
    };
    let task: T = serde_json::from_value(data)?;
    Ok(Box::new(task))
}

/// Maps stored task kinds to their decoders.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type.
    pub fn register<T: Task + TaskKind>(&mut self) -> &mut Self {
        self.decoders.insert(T::KIND, decode_kind::<T>);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with<T: Task + TaskKind>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Whether a decoder exists for the kind.
    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.decoders.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Decode a stored task.
    pub fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Task>, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let decoder = self
            .decoders
            .get(envelope.kind.as_str())
            .ok_or_else(|| CodecError::UnknownKind(envelope.kind.clone()))?;
        decoder(envelope.version, envelope.data)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
