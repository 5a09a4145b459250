//! Error types for ZIP tail handling.

use thiserror::Error;

/// ZIP parsing and rewriting errors.
#[derive(Debug, Error)]
pub enum ZipError {
    /// No EOCD signature in the trailing view.
    #[error("not a zip archive: no end-of-central-directory record found")]
    NotAZip,

    /// ZIP64, multi-disk, or otherwise out-of-contract archive.
    #[error("unsupported archive: {0}")]
    Unsupported(String),

    /// Compression method other than stored (0) or deflate (8).
    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u16),

    /// A structure extends past the bytes provided for it.
    #[error("truncated zip structure: {0}")]
    Truncated(String),

    /// Deflate stream failed to decode.
    #[error("inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
}

/// Result type alias for ZIP operations.
pub type ZipResult<T> = std::result::Result<T, ZipError>;
