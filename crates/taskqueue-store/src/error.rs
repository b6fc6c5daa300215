//! Store errors.

use thiserror::Error;

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Queue does not exist.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// A stored row could not be interpreted.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            // Errors raised inside `Connection::call` closures travel as `Other`
            tokio_rusqlite::Error::Other(inner) => match inner.downcast::<StoreError>() {
                Ok(store_err) => *store_err,
                Err(other) => StoreError::Database(other.to_string()),
            },
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<StoreError> for tokio_rusqlite::Error {
    fn from(err: StoreError) -> Self {
        tokio_rusqlite::Error::Other(Box::new(err))
    }
}
