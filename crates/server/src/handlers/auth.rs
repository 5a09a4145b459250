//! Auth endpoints: status, challenge, setup, login, logout, password change.

use crate::auth::{
    clear_session_cookie, has_valid_session, is_local_request, issue_token, session_cookie,
};
use crate::error::{ApiError, ApiResult};
use crate::password::{hash_password, verify_password};
use crate::pow::Challenge;
use crate::state::AppState;
use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Serialize)]
pub struct AuthStatus {
    pub required: bool,
    pub setup: bool,
    pub authenticated: bool,
}

pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<AuthStatus>> {
    let setup = state.tasks.get_password_hash().await?.is_some();
    let authenticated = has_valid_session(&state, &headers).await?;
    Ok(Json(AuthStatus {
        required: true,
        setup,
        authenticated,
    }))
}

pub async fn challenge(State(state): State<AppState>) -> Json<Challenge> {
    Json(state.pow.issue())
}

#[derive(Deserialize)]
pub struct SetupRequest {
    pub password: String,
    pub challenge: String,
    pub nonce: String,
}

pub async fn setup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SetupRequest>,
) -> ApiResult<Response> {
    state
        .pow
        .verify(&req.challenge, &req.nonce)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    validate_password(&req.password)?;

    let hash = hash_password(&req.password);
    if !state.tasks.set_password_hash_if_absent(&hash).await? {
        return Err(ApiError::BadRequest("already set up".to_string()));
    }

    tracing::info!("initial password configured");
    Ok(session_response(&hash, &headers))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub password: String,
    pub challenge: String,
    pub nonce: String,
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Response> {
    state
        .pow
        .verify(&req.challenge, &req.nonce)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let hash = state
        .tasks
        .get_password_hash()
        .await?
        .ok_or_else(|| ApiError::BadRequest("setup required".to_string()))?;

    if !verify_password(&req.password, &hash) {
        return Err(ApiError::Unauthorized("invalid password".to_string()));
    }

    Ok(session_response(&hash, &headers))
}

pub async fn logout(headers: HeaderMap) -> Response {
    let cookie = clear_session_cookie(is_local_request(&headers));
    (
        [(SET_COOKIE, cookie)],
        Json(serde_json::json!({ "success": true })),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(rename = "currentPassword")]
    pub current_password: String,
    #[serde(rename = "newPassword")]
    pub new_password: String,
    pub challenge: String,
    pub nonce: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Response> {
    state
        .pow
        .verify(&req.challenge, &req.nonce)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    validate_password(&req.new_password)?;

    let current = state
        .tasks
        .get_password_hash()
        .await?
        .ok_or_else(|| ApiError::BadRequest("setup required".to_string()))?;
    if !verify_password(&req.current_password, &current) {
        return Err(ApiError::Unauthorized("invalid password".to_string()));
    }

    // Rotating the hash invalidates every outstanding session token.
    let hash = hash_password(&req.new_password);
    state.tasks.set_password_hash(&hash).await?;
    tracing::info!("password rotated");

    Ok(session_response(&hash, &headers))
}

fn validate_password(password: &str) -> ApiResult<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn session_response(password_hash: &str, headers: &HeaderMap) -> Response {
    let token = issue_token(password_hash);
    let cookie = session_cookie(&token, is_local_request(headers));
    (
        [(SET_COOKIE, cookie)],
        Json(serde_json::json!({ "success": true })),
    )
        .into_response()
}
