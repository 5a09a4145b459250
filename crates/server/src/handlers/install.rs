//! Over-the-air install endpoints.
//!
//! Public by UUID: installation URLs are unguessable, and iOS fetches them
//! without cookies.

use crate::auth::is_local_request;
use crate::error::{ApiError, ApiResult};
use crate::handlers::packages::stream_artifact;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::HeaderMap;
use axum::response::Response;
use gantry_core::validate::sanitize_filename;
use uuid::Uuid;

/// `GET /install/{id}/manifest.plist`: the itms-services manifest.
pub async fn manifest(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let task = state
        .tasks
        .get_task_public(id)
        .await?
        .filter(|t| t.has_file)
        .ok_or_else(|| ApiError::NotFound(id.to_string()))?;

    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing Host header".to_string()))?;
    let scheme = if is_local_request(&headers) {
        "http"
    } else {
        "https"
    };
    let payload_url = format!("{scheme}://{host}/api/install/{id}/payload.ipa");

    let body = manifest_xml(
        &payload_url,
        &task.software.bundle_id,
        &task.software.version,
        &task.software.name,
    );
    let response = Response::builder()
        .header(CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(axum::body::Body::from(body))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

/// `GET /install/{id}/payload.ipa`: the artifact itself.
pub async fn payload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let task = state
        .tasks
        .get_task_public(id)
        .await?
        .filter(|t| t.has_file)
        .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
    let key = state
        .tasks
        .get_r2_key_public(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("artifact missing".to_string()))?;

    let filename = format!("{}.ipa", sanitize_filename(&task.software.name));
    stream_artifact(&state, &key, &filename).await
}

fn manifest_xml(payload_url: &str, bundle_id: &str, version: &str, title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>items</key>
  <array>
    <dict>
      <key>assets</key>
      <array>
        <dict>
          <key>kind</key>
          <string>software-package</string>
          <key>url</key>
          <string>{}</string>
        </dict>
      </array>
      <key>metadata</key>
      <dict>
        <key>bundle-identifier</key>
        <string>{}</string>
        <key>bundle-version</key>
        <string>{}</string>
        <key>kind</key>
        <string>software</string>
        <key>title</key>
        <string>{}</string>
      </dict>
    </dict>
  </array>
</dict>
</plist>
"#,
        xml_escape(payload_url),
        xml_escape(bundle_id),
        xml_escape(version),
        xml_escape(title)
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
