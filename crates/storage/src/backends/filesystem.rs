//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    validate_part_sequence, BatchDeleteOutcome, ByteStream, MultipartUpload, ObjectEntry,
    ObjectMeta, ObjectStore, UploadedPart,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum range size for get_range operations (128 MiB).
/// This prevents large memory allocations from user-controlled range requests.
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Get the full path for a key, with path traversal protection.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Synchronous key path validation with path traversal protection.
    ///
    /// Returns an error if the key would escape the storage root, including
    /// via symlinks anywhere on the resolved path.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Existing paths (including symlinks) must resolve inside the root.
        match std::fs::symlink_metadata(&path) {
            Ok(_) => {
                let canonical = path.canonicalize().map_err(|e| {
                    StorageError::Io(std::io::Error::new(
                        e.kind(),
                        format!("failed to canonicalize path: {e}"),
                    ))
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }

        // For new paths, the nearest existing ancestor must resolve inside
        // the root, so writes cannot be routed through a symlinked directory.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(_) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize ancestor: {e}"),
                        ))
                    })?;
                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::Io(err)),
            }
            ancestor = parent;
        }

        Ok(path)
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn not_found(key: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            etag: None,
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        if end == start {
            return Ok(Bytes::new());
        }
        let range_size = end - start;
        if range_size > MAX_RANGE_SIZE {
            return Err(StorageError::InvalidRange(format!(
                "range size {range_size} exceeds maximum {MAX_RANGE_SIZE} bytes"
            )));
        }
        let len = usize::try_from(range_size).map_err(|_| {
            StorageError::InvalidRange(format!(
                "range size {range_size} exceeds platform address space"
            ))
        })?;

        let path = self.key_path(key).await?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;

        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;

        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        // Write to a uniquely named temp file, fsync, then rename for
        // atomicity under concurrent writers.
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        let temp_path = path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        );
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_multipart(&self, key: &str) -> StorageResult<Box<dyn MultipartUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let staging_dir = path.with_file_name(format!(
            "{}.mp.{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4()
        ));
        fs::create_dir_all(&staging_dir).await?;

        Ok(Box::new(FilesystemMultipart {
            key: key.to_string(),
            staging_dir,
            final_path: path,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(backend = "filesystem", count = keys.len()))]
    async fn delete_batch(&self, keys: &[String]) -> StorageResult<BatchDeleteOutcome> {
        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            match self.delete(key).await {
                Ok(()) | Err(StorageError::NotFound(_)) => outcome.deleted += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "batch delete failed for key");
                    outcome.failed.push(key.clone());
                }
            }
        }
        Ok(outcome)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectEntry>> {
        let base_path = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.key_path(prefix).await?
        };
        let mut results = Vec::new();

        match fs::try_exists(&base_path).await {
            Ok(false) => return Ok(results),
            Ok(true) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base_path];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks; symlinked entries are
                // skipped entirely.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        let name = rel.to_string_lossy();
                        // Skip in-flight multipart staging and temp files.
                        if name.contains(".mp.") || name.contains(".tmp.") {
                            continue;
                        }
                        let size = entry.metadata().await?.len();
                        results.push(ObjectEntry {
                            key: name.into_owned(),
                            size,
                        });
                    }
                }
            }
        }

        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "storage root is not a directory: {:?}",
                self.root
            ))));
        }

        Ok(())
    }
}

/// Multipart upload backed by per-part staging files, concatenated on
/// complete.
struct FilesystemMultipart {
    key: String,
    staging_dir: PathBuf,
    final_path: PathBuf,
}

impl FilesystemMultipart {
    fn part_path(&self, part_number: i32) -> PathBuf {
        self.staging_dir.join(format!("part-{part_number:05}"))
    }
}

#[async_trait]
impl MultipartUpload for FilesystemMultipart {
    fn key(&self) -> &str {
        &self.key
    }

    async fn upload_part(&mut self, part_number: i32, data: Bytes) -> StorageResult<UploadedPart> {
        if part_number < 1 {
            return Err(StorageError::InvalidPart(format!(
                "part number must be >= 1, got {part_number}"
            )));
        }
        let path = self.part_path(part_number);
        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        Ok(UploadedPart {
            part_number,
            etag: format!("part-{part_number}-{}", data.len()),
        })
    }

    async fn complete(self: Box<Self>, parts: Vec<UploadedPart>) -> StorageResult<()> {
        validate_part_sequence(&parts)?;

        if parts.is_empty() {
            fs::write(&self.final_path, b"").await?;
            let _ = fs::remove_dir_all(&self.staging_dir).await;
            return Ok(());
        }

        let temp_path = self.staging_dir.join("assembled");
        {
            let mut out = fs::File::create(&temp_path).await?;
            for part in &parts {
                let data = fs::read(self.part_path(part.part_number)).await?;
                out.write_all(&data).await?;
            }
            out.sync_all().await?;
        }
        fs::rename(&temp_path, &self.final_path).await?;
        let _ = fs::remove_dir_all(&self.staging_dir).await;

        Ok(())
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let _ = fs::remove_dir_all(&self.staging_dir).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_head_range_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend
            .put("pkg/object", Bytes::from_static(b"hello world"))
            .await
            .unwrap();
        assert_eq!(backend.head("pkg/object").await.unwrap().size, 11);
        assert_eq!(
            backend.get_range("pkg/object", 6, 11).await.unwrap(),
            Bytes::from_static(b"world")
        );
        assert_eq!(
            backend.get_range("pkg/object", 3, 3).await.unwrap(),
            Bytes::new()
        );
    }

    #[tokio::test]
    async fn get_range_validates_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        backend.put("a", Bytes::from_static(b"xyz")).await.unwrap();

        assert!(matches!(
            backend.get_range("a", 5, 2).await,
            Err(StorageError::InvalidRange(_))
        ));
        assert!(matches!(
            backend.get_range("a", 0, MAX_RANGE_SIZE + 1).await,
            Err(StorageError::InvalidRange(_))
        ));
    }

    #[tokio::test]
    async fn path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(backend.head("../escape").await.is_err());
        assert!(backend.head("/absolute/path").await.is_err());
        assert!(backend.head("foo/../bar").await.is_err());
    }

    #[tokio::test]
    async fn multipart_concatenates_in_part_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let mut upload = backend.create_multipart("out.bin").await.unwrap();
        let p1 = upload
            .upload_part(1, Bytes::from_static(b"aaa"))
            .await
            .unwrap();
        let p2 = upload
            .upload_part(2, Bytes::from_static(b"bbb"))
            .await
            .unwrap();
        let p3 = upload
            .upload_part(3, Bytes::from_static(b"c"))
            .await
            .unwrap();
        upload.complete(vec![p1, p2, p3]).await.unwrap();

        assert_eq!(
            backend.get_range("out.bin", 0, 7).await.unwrap(),
            Bytes::from_static(b"aaabbbc")
        );
    }

    #[tokio::test]
    async fn multipart_complete_rejects_gapped_parts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let mut upload = backend.create_multipart("out.bin").await.unwrap();
        let p1 = upload
            .upload_part(1, Bytes::from_static(b"aaa"))
            .await
            .unwrap();
        let p3 = upload
            .upload_part(3, Bytes::from_static(b"ccc"))
            .await
            .unwrap();
        assert!(matches!(
            upload.complete(vec![p1, p3]).await,
            Err(StorageError::InvalidPart(_))
        ));
        assert!(backend.head("out.bin").await.is_err());
    }

    #[tokio::test]
    async fn multipart_abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let mut upload = backend.create_multipart("gone.bin").await.unwrap();
        upload
            .upload_part(1, Bytes::from_static(b"data"))
            .await
            .unwrap();
        upload.abort().await.unwrap();

        assert!(backend.head("gone.bin").await.is_err());
        assert!(backend.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_reports_sizes_and_skips_staging() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend
            .put("packages/a/x.ipa", Bytes::from(vec![0u8; 10]))
            .await
            .unwrap();
        backend
            .put("packages/b/y.ipa", Bytes::from(vec![0u8; 20]))
            .await
            .unwrap();
        // An in-flight multipart should not appear in listings.
        let mut upload = backend.create_multipart("packages/c/z.ipa").await.unwrap();
        upload
            .upload_part(1, Bytes::from_static(b"partial"))
            .await
            .unwrap();

        let mut entries = backend.list("packages").await.unwrap();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "packages/a/x.ipa");
        assert_eq!(entries[0].size, 10);
        assert_eq!(entries[1].size, 20);

        upload.abort().await.unwrap();
    }

    #[tokio::test]
    async fn delete_batch_counts_missing_as_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.put("a", Bytes::from_static(b"1")).await.unwrap();
        let outcome = backend
            .delete_batch(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 2);
        assert!(outcome.failed.is_empty());
        assert!(backend.head("a").await.is_err());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn symlink_traversal_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        symlink(outside.path(), dir.path().join("link")).unwrap();

        assert!(backend.head("link/secret.txt").await.is_err());
        assert!(backend
            .put("link/nested/file", Bytes::from_static(b"x"))
            .await
            .is_err());
    }
}
