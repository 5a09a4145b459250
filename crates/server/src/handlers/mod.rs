//! HTTP handlers.

pub mod auth;
pub mod downloads;
pub mod install;
pub mod packages;
pub mod settings;
pub mod tunnel;

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;

/// Health check for load balancers; intentionally unauthenticated.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state.storage.health_check().await?;
    state.tasks.get_password_hash().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
