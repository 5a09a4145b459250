//! Download-and-inject pipeline.
//!
//! The [`engine::DownloadEngine`] streams a CDN artifact into a multipart
//! blob-store upload with double buffering, retry, stall detection, and
//! cancellation, then hands off to the [`inject`] step which rewrites the
//! archive tail to add SINF and metadata entries without a full read.

pub mod engine;
pub mod error;
pub mod inject;
pub mod progress;
pub mod registry;

pub use engine::DownloadEngine;
pub use error::{PipelineError, PipelineResult};
pub use registry::DownloadRegistry;
