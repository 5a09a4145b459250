//! Core domain types for Gantry.
//!
//! This crate defines:
//! - The software descriptor, SINF record, and download task model
//! - Sanitized task records (the only shape that crosses the API boundary)
//! - Artifact key derivation and input validation
//! - Shared configuration types

pub mod config;
pub mod error;
pub mod keys;
pub mod task;
pub mod validate;

pub use error::{Error, Result};
pub use keys::{artifact_key, staging_key};
pub use task::{DownloadTask, SanitizedTask, Sinf, Software, TaskStatus};

/// Hard cap on artifact size (8 GiB).
pub const MAX_ARTIFACT_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Multipart upload part size used by the download engine (25 MiB).
pub const UPLOAD_PART_SIZE: usize = 25 * 1024 * 1024;

/// Chunk size for prefix copies during injection (50 MiB).
pub const INJECT_COPY_CHUNK: u64 = 50 * 1024 * 1024;
