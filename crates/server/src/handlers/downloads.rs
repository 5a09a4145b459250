//! Download task RPCs.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use gantry_core::task::{SanitizedTask, Sinf, Software};
use gantry_core::{artifact_key, staging_key};
use gantry_tasks::NewTaskParams;
use serde::Deserialize;
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct AccountQuery {
    #[serde(rename = "accountHash")]
    pub account_hash: String,
}

#[derive(Deserialize)]
pub struct AccountsQuery {
    #[serde(rename = "accountHashes", default)]
    pub account_hashes: String,
}

impl AccountsQuery {
    pub fn split(&self) -> Vec<String> {
        self.account_hashes
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}

#[derive(Deserialize)]
pub struct CreateDownloadRequest {
    pub software: Software,
    #[serde(rename = "accountHash")]
    pub account_hash: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    #[serde(default)]
    pub sinfs: Vec<Sinf>,
    #[serde(rename = "iTunesMetadata")]
    pub itunes_metadata: Option<String>,
}

/// `POST /downloads`: validate, dedup, persist, and kick off the download in
/// the background.
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateDownloadRequest>,
) -> ApiResult<(StatusCode, Json<SanitizedTask>)> {
    let task = state
        .tasks
        .create_task(NewTaskParams {
            software: req.software,
            account_hash: req.account_hash,
            download_url: req.download_url,
            sinfs: req.sinfs,
            itunes_metadata: req.itunes_metadata,
        })
        .await?;

    let sanitized = task.sanitized();
    state.engine.spawn(task);
    metrics::ACTIVE_DOWNLOADS.set(state.downloads.len() as i64);

    Ok((StatusCode::CREATED, Json(sanitized)))
}

/// `GET /downloads?accountHashes=...`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<AccountsQuery>,
) -> ApiResult<Json<Vec<SanitizedTask>>> {
    Ok(Json(state.tasks.list_tasks(&query.split()).await?))
}

/// `GET /downloads/{id}?accountHash=...`
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<Json<SanitizedTask>> {
    state
        .tasks
        .get_task(id, &query.account_hash)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(id.to_string()))
}

/// `POST /downloads/{id}/pause?accountHash=...`
pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<Json<SanitizedTask>> {
    if !state.tasks.pause_task(id, &query.account_hash).await? {
        return Err(ApiError::BadRequest(
            "task is not downloading".to_string(),
        ));
    }
    // The record is already `paused`; the engine consumes the cancellation
    // silently.
    state.downloads.cancel(id);

    state
        .tasks
        .get_task(id, &query.account_hash)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(id.to_string()))
}

/// `POST /downloads/{id}/resume?accountHash=...`
pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<Json<SanitizedTask>> {
    let task = state
        .tasks
        .resume_task(id, &query.account_hash)
        .await?
        .ok_or_else(|| ApiError::BadRequest("task is not paused".to_string()))?;

    let sanitized = task.sanitized();
    // Restart from scratch; partial multipart state was aborted on pause.
    state.engine.spawn(task);
    metrics::ACTIVE_DOWNLOADS.set(state.downloads.len() as i64);

    Ok(Json(sanitized))
}

/// `DELETE /downloads/{id}?accountHash=...`
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = state
        .tasks
        .get_task_owned(id, &query.account_hash)
        .await?
        .ok_or_else(|| ApiError::NotFound(id.to_string()))?;

    state.downloads.cancel(id);

    // Stored key, deterministic key, and the staging sibling of each; the
    // set collapses duplicates.
    let mut keys = BTreeSet::new();
    if let Some(stored) = state.tasks.get_r2_key_public(id).await? {
        keys.insert(staging_key(&stored));
        keys.insert(stored);
    }
    let deterministic = artifact_key(&task.account_hash, &task.software.bundle_id, id);
    keys.insert(staging_key(&deterministic));
    keys.insert(deterministic);

    let keys: Vec<String> = keys.into_iter().collect();
    match state.storage.delete_batch(&keys).await {
        Ok(outcome) if !outcome.failed.is_empty() => {
            tracing::warn!(task_id = %id, failed = ?outcome.failed, "artifact delete incomplete");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(task_id = %id, error = %e, "artifact delete failed"),
    }

    state.tasks.purge_task(id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}
