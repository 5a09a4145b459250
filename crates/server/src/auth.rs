//! Session tokens, cookies, and the auth middleware.

use crate::error::{ApiError, ApiResult};
use crate::password::{constant_time_eq, hmac_sha256};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::{COOKIE, HOST};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};

/// Session cookie name.
pub const SESSION_COOKIE: &str = "gantry_session";

/// Session lifetime.
const SESSION_TTL: Duration = Duration::days(7);

#[derive(Deserialize, serde::Serialize)]
struct TokenPayload {
    exp: i64,
}

/// Key derivation: sessions are bound to the current password hash, so a
/// password change invalidates every outstanding token.
fn session_key(password_hash: &str) -> [u8; 32] {
    hmac_sha256(password_hash.as_bytes(), b"gantry-session-key-v1")
}

/// Mint a session token: `base64url(payload).base64url(hmac)`.
pub fn issue_token(password_hash: &str) -> String {
    let payload = serde_json::to_string(&TokenPayload {
        exp: (OffsetDateTime::now_utc() + SESSION_TTL).unix_timestamp(),
    })
    .expect("payload serialization cannot fail");
    let sig = hmac_sha256(&session_key(password_hash), payload.as_bytes());
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(payload),
        URL_SAFE_NO_PAD.encode(sig)
    )
}

/// Validate a session token against the current password hash.
pub fn validate_token(password_hash: &str, token: &str) -> bool {
    let Some((payload_b64, sig_b64)) = token.split_once('.') else {
        return false;
    };
    let Ok(payload) = URL_SAFE_NO_PAD.decode(payload_b64) else {
        return false;
    };
    let Ok(sig) = URL_SAFE_NO_PAD.decode(sig_b64) else {
        return false;
    };
    if !constant_time_eq(&sig, &hmac_sha256(&session_key(password_hash), &payload)) {
        return false;
    }
    let Ok(parsed) = serde_json::from_slice::<TokenPayload>(&payload) else {
        return false;
    };
    parsed.exp > OffsetDateTime::now_utc().unix_timestamp()
}

/// Whether the request targets a literal localhost (cookie attributes relax).
pub fn is_local_request(headers: &HeaderMap) -> bool {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| host == "localhost" || host.starts_with("localhost:"))
        .unwrap_or(false)
}

/// Build the session Set-Cookie value.
pub fn session_cookie(token: &str, local: bool) -> String {
    if local {
        format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax")
    } else {
        format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; Secure; SameSite=Strict")
    }
}

/// Build a Set-Cookie value that clears the session.
pub fn clear_session_cookie(local: bool) -> String {
    if local {
        format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
    } else {
        format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=0")
    }
}

/// Extract the session token from the Cookie header.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Whether the request carries a valid session for the stored hash.
pub async fn has_valid_session(state: &AppState, headers: &HeaderMap) -> ApiResult<bool> {
    let Some(hash) = state.tasks.get_password_hash().await? else {
        return Ok(false);
    };
    Ok(extract_session_token(headers)
        .map(|token| validate_token(&hash, &token))
        .unwrap_or(false))
}

/// Middleware guarding the tunnel and task RPCs.
pub async fn require_session(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !has_valid_session(&state, req.headers()).await? {
        return Err(ApiError::Unauthorized(
            "valid session required".to_string(),
        ));
    }
    Ok(next.run(req).await)
}
