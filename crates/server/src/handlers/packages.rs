//! Completed-package listing and artifact delivery.

use crate::error::{ApiError, ApiResult};
use crate::handlers::downloads::{AccountQuery, AccountsQuery};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use gantry_core::task::SanitizedTask;
use gantry_core::validate::sanitize_filename;
use uuid::Uuid;

/// `GET /packages?accountHashes=...`: completed-only subset.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<AccountsQuery>,
) -> ApiResult<Json<Vec<SanitizedTask>>> {
    let tasks = state.tasks.list_tasks(&query.split()).await?;
    Ok(Json(tasks.into_iter().filter(|t| t.has_file).collect()))
}

/// `GET /packages/{id}/file?accountHash=...`: 302 to the CDN when one is
/// configured, else a streamed attachment.
pub async fn file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<Response> {
    let task = state
        .tasks
        .get_task(id, &query.account_hash)
        .await?
        .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    if !task.has_file {
        return Err(ApiError::NotFound("package not completed".to_string()));
    }
    let key = state
        .tasks
        .get_r2_key_public(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("artifact missing".to_string()))?;

    if let Some(domain) = state.config.server.effective_cdn_domain() {
        let response = Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, format!("https://{domain}/{key}"))
            .body(Body::empty())
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        return Ok(response);
    }

    let filename = format!(
        "{}_{}.ipa",
        sanitize_filename(&task.software.name),
        sanitize_filename(&task.software.version)
    );
    stream_artifact(&state, &key, &filename).await
}

/// Stream a stored artifact as an attachment.
pub async fn stream_artifact(
    state: &AppState,
    key: &str,
    filename: &str,
) -> ApiResult<Response> {
    let meta = state.storage.head(key).await?;
    let stream = state.storage.get_stream(key).await?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, meta.size)
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}
