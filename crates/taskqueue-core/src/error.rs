//! Queue errors.

use taskqueue_store::StoreError;
use thiserror::Error;

/// Errors raised while decoding a stored task or event.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bytes are not a valid envelope.
    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// No decoder is registered for the kind.
    #[error("Unknown task kind: {0}")]
    UnknownKind(String),

    /// Stored version cannot be upgraded to the current one.
    #[error("Unsupported version {found} of {kind} (current {supported})")]
    UnsupportedVersion {
        kind: String,
        found: u32,
        supported: u32,
    },
}

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Task or event could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The manager has been shut down.
    #[error("Queue manager is shutting down")]
    ShuttingDown,
}
