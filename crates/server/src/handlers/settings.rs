//! Cleanup settings and storage totals.

use crate::error::{ApiError, ApiResult};
use crate::janitor::{run_janitor, JanitorReport};
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use gantry_core::config::CleanupSettings;
use serde::Serialize;

#[derive(Serialize)]
pub struct StorageTotals {
    #[serde(rename = "objectCount")]
    pub object_count: usize,
    #[serde(rename = "totalSizeMB")]
    pub total_size_mb: f64,
}

#[derive(Serialize)]
pub struct BuildMetadata {
    pub commit: Option<String>,
    pub date: Option<String>,
}

/// Settings payload. Built exclusively from server-side state; request
/// headers are never reflected here.
#[derive(Serialize)]
pub struct SettingsResponse {
    #[serde(flatten)]
    pub cleanup: CleanupSettings,
    pub storage: StorageTotals,
    pub build: BuildMetadata,
}

/// `GET /settings`
pub async fn get(State(state): State<AppState>) -> ApiResult<Json<SettingsResponse>> {
    let cleanup = state.cleanup_settings().await;

    let entries = state.storage.list("packages").await?;
    let total_bytes: u64 = entries.iter().map(|e| e.size).sum();
    let storage = StorageTotals {
        object_count: entries.len(),
        total_size_mb: (total_bytes as f64) / (1024.0 * 1024.0),
    };

    Ok(Json(SettingsResponse {
        cleanup,
        storage,
        build: BuildMetadata {
            commit: state.config.build.commit.clone(),
            date: state.config.build.date.clone(),
        },
    }))
}

/// `PUT /settings`
pub async fn put(
    State(state): State<AppState>,
    Json(settings): Json<CleanupSettings>,
) -> ApiResult<Json<CleanupSettings>> {
    if settings.auto_cleanup_days > 10_000 {
        return Err(ApiError::BadRequest(
            "autoCleanupDays out of range".to_string(),
        ));
    }
    state.tasks.set_cleanup_settings(settings).await?;
    Ok(Json(settings))
}

/// `POST /cleanup`: run the janitor immediately.
pub async fn cleanup(State(state): State<AppState>) -> ApiResult<Json<JanitorReport>> {
    Ok(Json(run_janitor(&state).await))
}
