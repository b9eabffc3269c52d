use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::{ParseIdError, PayloadError};
use crate::store::StoreError;

/// Errors surfaced by the engine's public operations.
///
/// A failing job command is not in here: it is recorded as the job's
/// `last_error` and drives the retry/DLQ transition instead.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Caller input that cannot be turned into a job or config entry.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// Persistence failure. Fatal for the current operation, never retried here.
    #[error(transparent)]
    Store(StoreError),

    #[error("worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => QueueError::NotFound(id),
            other => QueueError::Store(other),
        }
    }
}

impl From<PayloadError> for QueueError {
    fn from(err: PayloadError) -> Self {
        QueueError::Validation(err.to_string())
    }
}

impl From<ConfigError> for QueueError {
    fn from(err: ConfigError) -> Self {
        QueueError::Validation(err.to_string())
    }
}

impl From<ParseIdError> for QueueError {
    fn from(err: ParseIdError) -> Self {
        QueueError::NotFound(err.0)
    }
}
