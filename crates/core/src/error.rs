//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("cancelled")]
    Cancelled,
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
