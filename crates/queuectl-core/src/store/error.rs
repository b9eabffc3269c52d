use thiserror::Error;

use crate::domain::JobState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("unknown id {0}")]
    NotFound(String),

    /// The row changed underneath us (duplicate id, lost claim, stale lock).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("illegal transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}
