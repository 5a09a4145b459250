//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Entity tag, if the backend provides one.
    pub etag: Option<String>,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// One listed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// A part acknowledged by the backend during a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Outcome of a batch delete. Failures are per-key and non-fatal; callers
/// log them and continue.
#[derive(Clone, Debug, Default)]
pub struct BatchDeleteOutcome {
    pub deleted: usize,
    pub failed: Vec<String>,
}

/// Object store abstraction over the artifact blob store.
///
/// Keys are `/`-separated paths. Concurrent reads against one key while a
/// *different* key is being written are always safe; callers that rewrite an
/// object use a sibling staging key and swap.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Get an object's size and etag without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get the byte range `[start, end)` of an object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Begin a multipart upload with caller-ordered part numbers.
    async fn create_multipart(&self, key: &str) -> StorageResult<Box<dyn MultipartUpload>>;

    /// Delete an object. Deleting a missing key is `NotFound`.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Delete many objects; missing keys are counted as deleted.
    async fn delete_batch(&self, keys: &[String]) -> StorageResult<BatchDeleteOutcome>;

    /// List all objects under a prefix, with sizes.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectEntry>>;

    /// Static identifier for the backend type (e.g., "s3", "filesystem").
    fn backend_name(&self) -> &'static str;

    /// Verify backend connectivity. Called once during server startup.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// An in-progress multipart upload.
///
/// Part numbers are assigned by the caller (the download engine numbers parts
/// in consumption order). `complete` must receive every uploaded part, sorted
/// ascending by part number.
#[async_trait]
pub trait MultipartUpload: Send {
    /// Destination key of this upload.
    fn key(&self) -> &str;

    /// Upload one part. All parts except the last must share the same size.
    async fn upload_part(&mut self, part_number: i32, data: Bytes) -> StorageResult<UploadedPart>;

    /// Finish the upload from the given parts.
    ///
    /// An empty part list publishes an empty object.
    async fn complete(self: Box<Self>, parts: Vec<UploadedPart>) -> StorageResult<()>;

    /// Abort the upload and discard any uploaded parts.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Verify that `parts` form the consecutive run 1..=n.
///
/// Backends call this from `complete`; the engine sorts before completing, so
/// a violation here is a bug in the caller, not a transient condition.
pub fn validate_part_sequence(parts: &[UploadedPart]) -> StorageResult<()> {
    for (index, part) in parts.iter().enumerate() {
        let expected = index as i32 + 1;
        if part.part_number != expected {
            return Err(crate::error::StorageError::InvalidPart(format!(
                "part sequence broken at index {index}: expected {expected}, got {}",
                part.part_number
            )));
        }
    }
    Ok(())
}
