//! CDN download engine.
//!
//! Streams the response body into a multipart upload with double buffering:
//! chunks accumulate in an in-memory list; with two full parts buffered the
//! oldest is uploaded synchronously, with one it is fired into a single
//! in-flight pending slot while reading continues. At most one pending part
//! upload is ever outstanding.

use crate::error::{PipelineError, PipelineResult};
use crate::inject;
use crate::progress::ProgressReporter;
use crate::registry::DownloadRegistry;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use gantry_core::task::{DownloadTask, TaskStatus};
use gantry_core::{artifact_key, MAX_ARTIFACT_SIZE, UPLOAD_PART_SIZE};
use gantry_storage::{MultipartUpload, ObjectStore, UploadedPart};
use gantry_tasks::TaskStore;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Retries after the initial attempt.
const MAX_RETRIES: u32 = 3;

/// Drives one task from `pending` to `completed` (or `failed`).
pub struct DownloadEngine {
    storage: Arc<dyn ObjectStore>,
    store: Arc<TaskStore>,
    registry: Arc<DownloadRegistry>,
    http: reqwest::Client,
    part_size: usize,
    stall_timeout: Duration,
    connect_timeout: Duration,
    backoff_base: Duration,
}

impl DownloadEngine {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        store: Arc<TaskStore>,
        registry: Arc<DownloadRegistry>,
    ) -> Self {
        let connect_timeout = Duration::from_secs(30);
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .expect("reqwest client construction cannot fail with static config");

        Self {
            storage,
            store,
            registry,
            http,
            part_size: UPLOAD_PART_SIZE,
            stall_timeout: Duration::from_secs(60),
            connect_timeout,
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Spawn the background worker for a task. The worker owns the task's
    /// cancellation token via the registry; pause/delete/janitor cancel
    /// through it.
    pub fn spawn(self: &Arc<Self>, task: DownloadTask) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.execute(task).await;
        });
    }

    /// Run a task's download (and injection) to completion.
    pub async fn execute(&self, task: DownloadTask) {
        let cancel = self.registry.register(task.id);
        let result = self.run(&task, cancel).await;
        self.registry.remove(task.id);

        match result {
            Ok(()) => {
                tracing::info!(task_id = %task.id, "download task completed");
            }
            Err(PipelineError::Cancelled) => {
                // Pause or delete already put the record where it belongs.
                tracing::debug!(task_id = %task.id, "download task cancelled");
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "download task failed");
                if let Err(store_err) = self.store.mark_failed(task.id, &e.to_string()).await {
                    tracing::error!(
                        task_id = %task.id,
                        error = %store_err,
                        "failed to record task failure"
                    );
                }
            }
        }
    }

    async fn run(&self, task: &DownloadTask, cancel: CancellationToken) -> PipelineResult<()> {
        let url = task
            .download_url
            .clone()
            .ok_or_else(|| PipelineError::Format("task has no download URL".to_string()))?;
        let key = artifact_key(&task.account_hash, &task.software.bundle_id, task.id);

        // Fresh creations arrive as `pending`; resumes are already
        // `downloading`.
        self.store
            .transition(task.id, TaskStatus::Pending, TaskStatus::Downloading)
            .await?;

        let response = self.fetch_with_retry(&url, &cancel).await?;
        self.stream_body(response, &key, task.id, &cancel).await?;

        if task.needs_injection() {
            if !self
                .store
                .transition(task.id, TaskStatus::Downloading, TaskStatus::Injecting)
                .await?
            {
                // The task was paused or deleted during the final stretch.
                return Err(PipelineError::Cancelled);
            }
            inject::inject(self.storage.as_ref(), task, &key).await?;
        }

        let size = self.storage.head(&key).await?.size;
        self.store.mark_completed(task.id, &key, size).await?;
        Ok(())
    }

    /// Fetch with up to [`MAX_RETRIES`] retries and exponential backoff.
    /// HTTP status below 500 is non-retryable. Cancellation propagates out
    /// of both the request and the backoff sleep.
    async fn fetch_with_retry(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<reqwest::Response> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                result = tokio::time::timeout(self.connect_timeout, self.http.get(url).send()) => result,
            };

            let error = match outcome {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() >= 500 {
                        format!("CDN returned {status}")
                    } else {
                        return Err(PipelineError::Upstream(format!("CDN returned {status}")));
                    }
                }
                Ok(Err(e)) => format!("fetch failed: {e}"),
                Err(_) => format!(
                    "connection timed out after {}s",
                    self.connect_timeout.as_secs()
                ),
            };

            if attempt >= MAX_RETRIES {
                return Err(PipelineError::Upstream(format!(
                    "{error} (after {} attempts)",
                    attempt + 1
                )));
            }

            let backoff = self.backoff_base * 2u32.pow(attempt);
            tracing::warn!(url, attempt, error = %error, backoff_ms = backoff.as_millis() as u64, "retrying CDN fetch");
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    /// Stream the response body into a multipart upload at `key`.
    async fn stream_body(
        &self,
        response: reqwest::Response,
        key: &str,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> PipelineResult<u64> {
        let total = response.content_length();
        if let Some(declared) = total {
            if declared > MAX_ARTIFACT_SIZE {
                return Err(PipelineError::TooLarge(declared));
            }
        }

        let mut reporter = ProgressReporter::new(Arc::clone(&self.store), task_id);
        let mut stream = response.bytes_stream();
        let mut buffer = ChunkBuffer::new();
        let mut parts: Vec<UploadedPart> = Vec::new();
        let mut next_part: i32 = 1;
        let mut downloaded: u64 = 0;
        let mut slot = UploadSlot::Idle(self.storage.create_multipart(key).await?);

        let outcome: PipelineResult<()> = loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break Err(PipelineError::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => match next {
                    Err(_) => break Err(PipelineError::Stall(self.stall_timeout.as_secs())),
                    Ok(None) => break Ok(()),
                    Ok(Some(Err(e))) => break Err(PipelineError::Upstream(format!("body read failed: {e}"))),
                    Ok(Some(Ok(chunk))) => chunk,
                },
            };

            downloaded += chunk.len() as u64;
            if downloaded > MAX_ARTIFACT_SIZE {
                break Err(PipelineError::TooLarge(downloaded));
            }
            buffer.push(chunk);
            reporter.tick(downloaded, total).await;

            // Two full parts buffered: the reader is outrunning the uploader.
            // Drain the pending slot and ship the oldest part inline.
            while buffer.len() >= 2 * self.part_size {
                let mut upload = drain_slot(slot, &mut parts).await?;
                let data = buffer.take(self.part_size);
                match upload.upload_part(next_part, data).await {
                    Ok(part) => {
                        parts.push(part);
                        next_part += 1;
                        slot = UploadSlot::Idle(upload);
                    }
                    Err(e) => {
                        let _ = upload.abort().await;
                        return Err(e.into());
                    }
                }
            }

            // One full part and an idle slot: fire and keep reading.
            slot = match slot {
                UploadSlot::Idle(mut upload) if buffer.len() >= self.part_size => {
                    let data = buffer.take(self.part_size);
                    let part_number = next_part;
                    next_part += 1;
                    UploadSlot::Busy(tokio::spawn(async move {
                        let result = upload.upload_part(part_number, data).await;
                        (upload, result)
                    }))
                }
                other => other,
            };
        };

        if let Err(e) = outcome {
            if let Ok(upload) = drain_slot(slot, &mut parts).await {
                let _ = upload.abort().await;
            }
            return Err(e);
        }

        // Stream done: drain the pending slot, flush remaining full parts,
        // then the trailing partial.
        let mut upload = drain_slot(slot, &mut parts).await?;
        while buffer.len() >= self.part_size {
            let data = buffer.take(self.part_size);
            match upload.upload_part(next_part, data).await {
                Ok(part) => {
                    parts.push(part);
                    next_part += 1;
                }
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(e.into());
                }
            }
        }
        if buffer.len() > 0 {
            let data = buffer.take_all();
            match upload.upload_part(next_part, data).await {
                Ok(part) => parts.push(part),
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(e.into());
                }
            }
        }

        parts.sort_by_key(|p| p.part_number);
        upload.complete(parts).await?;
        Ok(downloaded)
    }
}

/// Single-slot mailbox for the one permitted in-flight part upload.
enum UploadSlot {
    Idle(Box<dyn MultipartUpload>),
    Busy(JoinHandle<(Box<dyn MultipartUpload>, gantry_storage::StorageResult<UploadedPart>)>),
}

/// Wait out the pending upload (if any) and hand the upload back.
///
/// A failed pending part aborts the whole multipart upload before returning
/// the error.
async fn drain_slot(
    slot: UploadSlot,
    parts: &mut Vec<UploadedPart>,
) -> PipelineResult<Box<dyn MultipartUpload>> {
    match slot {
        UploadSlot::Idle(upload) => Ok(upload),
        UploadSlot::Busy(handle) => {
            let (upload, result) = handle
                .await
                .map_err(|e| PipelineError::Upstream(format!("part upload task failed: {e}")))?;
            match result {
                Ok(part) => {
                    parts.push(part);
                    Ok(upload)
                }
                Err(e) => {
                    let _ = upload.abort().await;
                    Err(e.into())
                }
            }
        }
    }
}

/// FIFO of body chunks with O(1) length tracking.
struct ChunkBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkBuffer {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn push(&mut self, chunk: Bytes) {
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Remove exactly `n` bytes from the front.
    fn take(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.len);
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let mut chunk = self.chunks.pop_front().expect("buffer under-run");
            let want = n - out.len();
            if chunk.len() > want {
                out.extend_from_slice(&chunk.split_to(want));
                self.chunks.push_front(chunk);
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        self.len -= n;
        out.freeze()
    }

    fn take_all(&mut self) -> Bytes {
        let n = self.len;
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::task::{Sinf, Software};
    use gantry_storage::FilesystemBackend;
    use gantry_tasks::NewTaskParams;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct TestRig {
        _temp: tempfile::TempDir,
        storage: Arc<dyn ObjectStore>,
        store: Arc<TaskStore>,
        engine: Arc<DownloadEngine>,
        registry: Arc<DownloadRegistry>,
    }

    async fn rig() -> TestRig {
        let temp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(temp.path().join("storage")).await.unwrap());
        let store = Arc::new(TaskStore::new(temp.path().join("tasks.db")).await.unwrap());
        let registry = Arc::new(DownloadRegistry::new());

        let mut engine = DownloadEngine::new(
            Arc::clone(&storage),
            Arc::clone(&store),
            Arc::clone(&registry),
        );
        engine.part_size = 1024;
        engine.stall_timeout = Duration::from_millis(300);
        engine.backoff_base = Duration::from_millis(5);

        TestRig {
            _temp: temp,
            storage,
            store,
            engine: Arc::new(engine),
            registry,
        }
    }

    async fn create_task(store: &TaskStore, sinfs: Vec<Sinf>) -> DownloadTask {
        store
            .create_task(NewTaskParams {
                software: Software {
                    track_id: 1,
                    bundle_id: "com.x.y".to_string(),
                    name: "App".to_string(),
                    version: "1.0".to_string(),
                    extra: serde_json::Map::new(),
                },
                account_hash: "aaaaaaaa".to_string(),
                download_url: "https://cdn.apple.com/x.ipa".to_string(),
                sinfs,
                itunes_metadata: None,
            })
            .await
            .unwrap()
    }

    /// Serve canned HTTP responses on a loopback listener.
    async fn serve(
        responses: impl Fn(usize) -> (u16, Option<u64>, Vec<u8>) + Send + Sync + 'static,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_server = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let request_index = hits_server.fetch_add(1, Ordering::SeqCst);
                let (status, declared_len, body) = responses(request_index);
                tokio::spawn(async move {
                    // Consume the request head.
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;

                    let reason = if status == 200 { "OK" } else { "Error" };
                    let content_length = declared_len.unwrap_or(body.len() as u64);
                    let head = format!(
                        "HTTP/1.1 {status} {reason}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.flush().await;
                });
            }
        });

        (format!("http://{addr}/x.ipa"), hits)
    }

    fn pattern_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn happy_path_completes_and_assembles_parts() {
        let rig = rig().await;
        let body = pattern_bytes(5000); // 4 full 1 KiB parts + 1 partial
        let body_served = body.clone();
        let (url, _) = serve(move |_| (200, None, body_served.clone())).await;

        let mut task = create_task(&rig.store, vec![]).await;
        task.download_url = Some(url);
        rig.engine.execute(task.clone()).await;

        let record = rig.store.get_task_raw(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.file_size, Some(5000));
        assert!(record.download_url.is_none());

        let key = artifact_key("aaaaaaaa", "com.x.y", task.id);
        assert_eq!(
            rig.store.get_r2_key_public(task.id).await.unwrap(),
            Some(key.clone())
        );
        let stored = rig.storage.get_range(&key, 0, 5000).await.unwrap();
        assert_eq!(stored.as_ref(), body.as_slice());
        assert!(rig.registry.is_empty());
    }

    #[tokio::test]
    async fn declared_oversize_fails_without_artifact() {
        let rig = rig().await;
        let (url, _) = serve(|_| (200, Some(9_000_000_000), Vec::new())).await;

        let mut task = create_task(&rig.store, vec![]).await;
        task.download_url = Some(url);
        rig.engine.execute(task.clone()).await;

        let record = rig.store.get_task_raw(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("too large"));

        // Multipart aborted: nothing under packages/.
        assert!(rig.storage.list("packages").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let rig = rig().await;
        let (url, hits) = serve(|_| (404, None, b"not found".to_vec())).await;

        let mut task = create_task(&rig.store, vec![]).await;
        task.download_url = Some(url);
        rig.engine.execute(task.clone()).await;

        let record = rig.store.get_task_raw(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("404"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_retry_then_fail() {
        let rig = rig().await;
        let (url, hits) = serve(|_| (500, None, Vec::new())).await;

        let mut task = create_task(&rig.store, vec![]).await;
        task.download_url = Some(url);
        rig.engine.execute(task.clone()).await;

        let record = rig.store.get_task_raw(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("500"));
        // Initial attempt plus three retries.
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stalled_body_fails_with_stall_error() {
        let rig = rig().await;
        // Declare more bytes than are sent, then leave the socket open.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n")
                .await;
            let _ = socket.write_all(&[0u8; 512]).await;
            let _ = socket.flush().await;
            // Hold the connection open without sending the rest.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut task = create_task(&rig.store, vec![]).await;
        task.download_url = Some(format!("http://{addr}/x.ipa"));
        rig.engine.execute(task.clone()).await;

        let record = rig.store.get_task_raw(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("stalled"));
    }

    #[tokio::test]
    async fn cancellation_is_consumed_silently() {
        let rig = rig().await;
        // Slow drip server: one chunk, then a long pause.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n")
                .await;
            let _ = socket.write_all(&[1u8; 2048]).await;
            let _ = socket.flush().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut task = create_task(&rig.store, vec![]).await;
        task.download_url = Some(format!("http://{addr}/x.ipa"));
        // Move to `downloading` and pause-cancel shortly after the engine starts.
        let engine = Arc::clone(&rig.engine);
        let registry = Arc::clone(&rig.registry);
        let id = task.id;
        let worker = tokio::spawn(async move { engine.execute(task).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.store.pause_task(id, "aaaaaaaa").await.ok();
        registry.cancel(id);
        worker.await.unwrap();

        // The engine must not have overwritten the record with a failure.
        let record = rig.store.get_task_raw(id).await.unwrap().unwrap();
        assert_ne!(record.status, TaskStatus::Failed);
        assert!(rig.storage.list("packages").await.unwrap().is_empty());
    }
}
