//! Task store error types.

use thiserror::Error;

/// Errors from task store operations.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<gantry_core::Error> for TaskStoreError {
    fn from(err: gantry_core::Error) -> Self {
        match err {
            gantry_core::Error::Conflict(msg) => Self::Conflict(msg),
            gantry_core::Error::NotFound(msg) => Self::NotFound(msg),
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// Result type alias for task store operations.
pub type TaskStoreResult<T> = std::result::Result<T, TaskStoreError>;
