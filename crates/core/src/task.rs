//! Download task model.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Software descriptor supplied by the client.
///
/// Only `bundle_id`, `version`, and `name` are interpreted by the server
/// (deduplication and file naming); every other display field rides in
/// `extra` and is returned to the client unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Software {
    #[serde(rename = "trackId", default)]
    pub track_id: i64,
    #[serde(rename = "bundleID")]
    pub bundle_id: String,
    pub name: String,
    pub version: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A DRM signature blob and its position index inside the app bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sinf {
    pub id: u32,
    /// Base64-encoded signature bytes; decoded only by the injection step.
    pub sinf: String,
}

/// Lifecycle state of a download task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Injecting,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Injecting => "injecting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal success state.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent task record.
///
/// The secret fields (`download_url`, `sinfs`, `itunes_metadata`) are cleared
/// when the task transitions to `completed` and must never leave the store
/// unsanitized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: Uuid,
    pub software: Software,
    #[serde(rename = "accountHash")]
    pub account_hash: String,
    #[serde(rename = "downloadURL", skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sinfs: Vec<Sinf>,
    #[serde(rename = "iTunesMetadata", skip_serializing_if = "Option::is_none")]
    pub itunes_metadata: Option<String>,
    pub status: TaskStatus,
    pub progress: u8,
    pub speed: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Artifact size in bytes, recorded at completion.
    #[serde(rename = "fileSize", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl DownloadTask {
    /// Strip secrets and produce the outbound representation.
    pub fn sanitized(&self) -> SanitizedTask {
        SanitizedTask {
            id: self.id,
            software: self.software.clone(),
            account_hash: self.account_hash.clone(),
            status: self.status,
            progress: self.progress,
            speed: self.speed.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            has_file: self.status.is_completed(),
            file_size: if self.status.is_completed() {
                self.file_size
            } else {
                None
            },
        }
    }

    /// Clear the secret fields. Called on transition to `completed`.
    pub fn clear_secrets(&mut self) {
        self.download_url = None;
        self.sinfs.clear();
        self.itunes_metadata = None;
    }

    /// Whether the artifact needs DRM or metadata injection after download.
    pub fn needs_injection(&self) -> bool {
        !self.sinfs.is_empty()
            || self
                .itunes_metadata
                .as_deref()
                .is_some_and(|m| !m.is_empty())
    }
}

/// Outbound task record. Never carries `downloadURL`, `sinfs`, or
/// `iTunesMetadata`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SanitizedTask {
    pub id: Uuid,
    pub software: Software,
    #[serde(rename = "accountHash")]
    pub account_hash: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub speed: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(rename = "hasFile")]
    pub has_file: bool,
    #[serde(rename = "fileSize", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}
