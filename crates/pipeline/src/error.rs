//! Pipeline error types.

use thiserror::Error;

/// Errors from the download engine and injection step.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Artifact exceeds the 8 GiB cap. The message is user-visible on the
    /// failed task.
    #[error("artifact too large: {0} bytes exceeds the 8 GiB cap")]
    TooLarge(u64),

    /// No body chunk arrived within the stall window.
    #[error("CDN stalled: no data received for {0} seconds")]
    Stall(u64),

    /// Non-retryable upstream response, or retries exhausted.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Pause or delete cancelled the job; consumed silently by the engine.
    #[error("cancelled")]
    Cancelled,

    /// The archive is missing a required structure (bundle, plist, executable).
    #[error("format error: {0}")]
    Format(String),

    #[error(transparent)]
    Zip(#[from] gantry_ziptail::ZipError),

    #[error("storage error: {0}")]
    Storage(#[from] gantry_storage::StorageError),

    #[error("task store error: {0}")]
    TaskStore(#[from] gantry_tasks::TaskStoreError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
