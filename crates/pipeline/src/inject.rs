//! SINF and metadata injection.
//!
//! Rewrites the tail of a published archive to add DRM signature files and
//! an optional iTunesMetadata.plist, without ever reading the full archive:
//! ranged reads locate the EOCD, central directory, and the few plist
//! entries that drive SINF placement; the rewritten object is assembled via
//! multipart copy onto a sibling staging key and swapped into place.

use crate::error::{PipelineError, PipelineResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use gantry_core::task::DownloadTask;
use gantry_core::{staging_key, INJECT_COPY_CHUNK};
use gantry_storage::{MultipartUpload, ObjectStore, UploadedPart};
use gantry_ziptail::{
    append_suffix, decode_entry_data, find_eocd, local_data_len, parse_central_directory, CdEntry,
    NewFile, LOCAL_HEADER_SIZE, TAIL_VIEW_SIZE,
};
use regex::Regex;
use std::io::Cursor;
use std::sync::LazyLock;

/// `Payload/<bundle>.app/...` matcher; Watch-app payloads are skipped.
static APP_BUNDLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Payload/([^/]+)\.app/").expect("valid regex"));

/// Rewrite the artifact at `key` to carry the task's SINFs and metadata.
pub async fn inject(
    storage: &dyn ObjectStore,
    task: &DownloadTask,
    key: &str,
) -> PipelineResult<()> {
    let size = storage.head(key).await?.size;

    let tail_len = size.min(TAIL_VIEW_SIZE);
    let tail = storage.get_range(key, size - tail_len, size).await?;
    let eocd = find_eocd(&tail, size)?;
    let cd = storage
        .get_range(
            key,
            eocd.cd_offset as u64,
            eocd.cd_offset as u64 + eocd.cd_size as u64,
        )
        .await?;
    let entries = parse_central_directory(&cd)?;

    let bundle = app_bundle_name(&entries)
        .ok_or_else(|| PipelineError::Format("archive has no .app bundle".to_string()))?;
    let files = build_injection_files(storage, key, &entries, &bundle, task).await?;

    if files.is_empty() {
        return Ok(());
    }

    let appended = append_suffix(size, &entries, &eocd, &files)?;

    let staging = staging_key(key);
    let result = write_staged(storage, key, &staging, appended.split_offset, appended.tail).await;
    if let Err(e) = result {
        let _ = storage.delete(&staging).await;
        return Err(e);
    }

    // Swap: stream the staged object back onto the published key, then drop
    // the staging sibling. The key is not served until the task completes,
    // so no compare-and-set is needed.
    let swap = copy_object(storage, &staging, key).await;
    match storage.delete(&staging).await {
        Ok(()) | Err(gantry_storage::StorageError::NotFound(_)) => {}
        Err(e) => tracing::warn!(key = %staging, error = %e, "staging key cleanup failed"),
    }
    swap
}

/// First `Payload/<name>.app/` entry that is not under a Watch payload.
fn app_bundle_name(entries: &[CdEntry]) -> Option<String> {
    entries.iter().find_map(|entry| {
        if entry.name.contains("/Watch/") {
            return None;
        }
        APP_BUNDLE
            .captures(&entry.name)
            .map(|captures| captures[1].to_string())
    })
}

/// Resolve SINF target paths and assemble the entries to append.
async fn build_injection_files(
    storage: &dyn ObjectStore,
    key: &str,
    entries: &[CdEntry],
    bundle: &str,
    task: &DownloadTask,
) -> PipelineResult<Vec<NewFile>> {
    let mut files = Vec::new();

    if !task.sinfs.is_empty() {
        let sinf_paths = resolve_sinf_paths(storage, key, entries, bundle).await?;
        for (path, sinf) in sinf_paths.iter().zip(task.sinfs.iter()) {
            let data = BASE64.decode(&sinf.sinf).map_err(|e| {
                PipelineError::Format(format!("sinf {} is not valid base64: {e}", sinf.id))
            })?;
            files.push(NewFile {
                name: format!("Payload/{bundle}.app/{path}"),
                data,
            });
        }
    }

    if let Some(metadata) = task.itunes_metadata.as_deref().filter(|m| !m.is_empty()) {
        let xml = BASE64
            .decode(metadata)
            .map_err(|e| PipelineError::Format(format!("iTunesMetadata is not valid base64: {e}")))?;
        files.push(NewFile {
            name: "iTunesMetadata.plist".to_string(),
            data: metadata_to_binary(xml),
        });
    }

    Ok(files)
}

/// SINF placement: the bundle's `SC_Info/Manifest.plist` lists the target
/// paths; without one, a single SINF lands next to the executable named by
/// `Info.plist`.
async fn resolve_sinf_paths(
    storage: &dyn ObjectStore,
    key: &str,
    entries: &[CdEntry],
    bundle: &str,
) -> PipelineResult<Vec<String>> {
    let manifest_name = format!("Payload/{bundle}.app/SC_Info/Manifest.plist");
    if let Some(entry) = entries.iter().find(|e| e.name == manifest_name) {
        let data = read_entry(storage, key, entry).await?;
        if let Some(paths) = parse_sinf_paths(&data) {
            return Ok(paths);
        }
        tracing::warn!(key = %key, "Manifest.plist has no SinfPaths, falling back to Info.plist");
    }

    let info_name = format!("Payload/{bundle}.app/Info.plist");
    let entry = entries
        .iter()
        .find(|e| e.name == info_name)
        .ok_or_else(|| PipelineError::Format("archive has no Info.plist".to_string()))?;
    let data = read_entry(storage, key, entry).await?;
    let executable = parse_bundle_executable(&data)
        .ok_or_else(|| PipelineError::Format("Info.plist has no CFBundleExecutable".to_string()))?;

    Ok(vec![format!("SC_Info/{executable}.sinf")])
}

/// `SinfPaths` from a Manifest.plist (binary or XML).
fn parse_sinf_paths(data: &[u8]) -> Option<Vec<String>> {
    let value = plist::Value::from_reader(Cursor::new(data)).ok()?;
    let paths = value.as_dictionary()?.get("SinfPaths")?.as_array()?;
    let paths: Vec<String> = paths
        .iter()
        .filter_map(|p| p.as_string().map(|s| s.to_string()))
        .collect();
    (!paths.is_empty()).then_some(paths)
}

/// `CFBundleExecutable` from an Info.plist (binary or XML).
fn parse_bundle_executable(data: &[u8]) -> Option<String> {
    let value = plist::Value::from_reader(Cursor::new(data)).ok()?;
    value
        .as_dictionary()?
        .get("CFBundleExecutable")?
        .as_string()
        .map(|s| s.to_string())
}

/// Convert the XML metadata plist to binary. Conversion failures fall back
/// to the original XML bytes; they never fail the task.
fn metadata_to_binary(xml: Vec<u8>) -> Vec<u8> {
    let parsed = match plist::Value::from_reader_xml(Cursor::new(&xml)) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "iTunesMetadata XML parse failed, storing raw XML");
            return xml;
        }
    };
    let mut out = Vec::new();
    match parsed.to_writer_binary(&mut out) {
        Ok(()) => out,
        Err(e) => {
            tracing::warn!(error = %e, "iTunesMetadata binary conversion failed, storing raw XML");
            xml
        }
    }
}

/// Read one entry's decoded data with two range reads (local header, then
/// the data span).
async fn read_entry(
    storage: &dyn ObjectStore,
    key: &str,
    entry: &CdEntry,
) -> PipelineResult<Vec<u8>> {
    let header_start = entry.local_offset as u64;
    let header = storage
        .get_range(key, header_start, header_start + LOCAL_HEADER_SIZE as u64)
        .await?;
    let data_start = header_start + local_data_len(&header)?;
    let raw = storage
        .get_range(key, data_start, data_start + entry.compressed_size as u64)
        .await?;
    Ok(decode_entry_data(entry, &raw)?)
}

/// Assemble `original[0..split) ++ tail` under the staging key via multipart
/// copy. The final prefix chunk is concatenated with the tail so all
/// non-final parts share the same size.
async fn write_staged(
    storage: &dyn ObjectStore,
    source: &str,
    staging: &str,
    split: u64,
    tail: Vec<u8>,
) -> PipelineResult<()> {
    let mut upload = storage.create_multipart(staging).await?;
    let result = write_staged_parts(storage, source, upload.as_mut(), split, tail).await;
    match result {
        Ok(parts) => {
            upload.complete(parts).await?;
            Ok(())
        }
        Err(e) => {
            let _ = upload.abort().await;
            Err(e)
        }
    }
}

async fn write_staged_parts(
    storage: &dyn ObjectStore,
    source: &str,
    upload: &mut dyn MultipartUpload,
    split: u64,
    tail: Vec<u8>,
) -> PipelineResult<Vec<UploadedPart>> {
    let mut parts = Vec::new();
    let mut part_number: i32 = 1;
    let mut offset: u64 = 0;

    while split - offset > INJECT_COPY_CHUNK {
        let data = storage
            .get_range(source, offset, offset + INJECT_COPY_CHUNK)
            .await?;
        parts.push(upload.upload_part(part_number, data).await?);
        part_number += 1;
        offset += INJECT_COPY_CHUNK;
    }

    let mut last = BytesMut::new();
    if split > offset {
        last.extend_from_slice(&storage.get_range(source, offset, split).await?);
    }
    last.extend_from_slice(&tail);
    parts.push(upload.upload_part(part_number, last.freeze()).await?);

    Ok(parts)
}

/// Stream one object onto another key via multipart upload, never holding
/// the full object in memory.
async fn copy_object(storage: &dyn ObjectStore, from: &str, to: &str) -> PipelineResult<()> {
    use futures::StreamExt;

    let mut upload = storage.create_multipart(to).await?;
    let mut stream = storage.get_stream(from).await?;
    let mut parts: Vec<UploadedPart> = Vec::new();
    let mut pending = BytesMut::new();
    let mut part_number: i32 = 1;
    let chunk_size = INJECT_COPY_CHUNK as usize;

    let result: PipelineResult<()> = async {
        while let Some(chunk) = stream.next().await {
            pending.extend_from_slice(&chunk?);
            while pending.len() >= chunk_size {
                let data = pending.split_to(chunk_size).freeze();
                parts.push(upload.upload_part(part_number, data).await?);
                part_number += 1;
            }
        }
        if !pending.is_empty() {
            let data = pending.split().freeze();
            parts.push(upload.upload_part(part_number, data).await?);
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            upload.complete(parts).await?;
            Ok(())
        }
        Err(e) => {
            let _ = upload.abort().await;
            Err(e)
        }
    }
}
