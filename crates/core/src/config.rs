//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Proof-of-work difficulty in leading zero bits, clamped to [16, 24].
    #[serde(default = "default_pow_difficulty")]
    pub pow_difficulty: u32,
    /// Optional public CDN domain for package downloads (302 redirects).
    /// Must match `^[\w.-]+$`.
    #[serde(default)]
    pub cdn_domain: Option<String>,
    /// Enable the /metrics endpoint for Prometheus scraping.
    #[serde(default)]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_pow_difficulty() -> u32 {
    18
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            pow_difficulty: default_pow_difficulty(),
            cdn_domain: None,
            metrics_enabled: false,
        }
    }
}

impl ServerConfig {
    /// Difficulty clamped to the supported range.
    pub fn effective_pow_difficulty(&self) -> u32 {
        self.pow_difficulty.clamp(16, 24)
    }

    /// CDN domain, if configured and well-formed. Malformed values are
    /// treated as absent rather than failing startup.
    pub fn effective_cdn_domain(&self) -> Option<&str> {
        let domain = self.cdn_domain.as_deref()?;
        let ok = !domain.is_empty()
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
        ok.then_some(domain)
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, R2, etc.).
        endpoint: Option<String>,
        /// Region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// Access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// Secret access key. Falls back to the ambient credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO
        /// and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// Task store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    /// SQLite database file path.
    #[serde(default = "default_task_db_path")]
    pub path: PathBuf,
}

fn default_task_db_path() -> PathBuf {
    PathBuf::from("./data/tasks.db")
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            path: default_task_db_path(),
        }
    }
}

/// Cleanup tunables. Values of 0 disable the corresponding janitor phase.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupSettings {
    #[serde(rename = "autoCleanupDays")]
    pub auto_cleanup_days: u32,
    #[serde(rename = "autoCleanupMaxMB")]
    pub auto_cleanup_max_mb: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            auto_cleanup_days: 0,
            auto_cleanup_max_mb: 0,
        }
    }
}

/// Build metadata surfaced by the settings endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BuildInfo {
    pub commit: Option<String>,
    pub date: Option<String>,
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tasks: TaskStoreConfig,
    /// Cleanup defaults; overridden by values persisted in the task store.
    #[serde(default)]
    pub cleanup: CleanupSettings,
    #[serde(default)]
    pub build: BuildInfo,
}

impl AppConfig {
    /// Apply the well-known environment inputs on top of file/env-tree config.
    ///
    /// `AUTO_CLEANUP_DAYS`, `AUTO_CLEANUP_MAX_MB`, `POW_DIFFICULTY`,
    /// `R2_CDN_DOMAIN`, `BUILD_COMMIT`, `BUILD_DATE`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(days) = env_u64("AUTO_CLEANUP_DAYS") {
            self.cleanup.auto_cleanup_days = days.min(u32::MAX as u64) as u32;
        }
        if let Some(mb) = env_u64("AUTO_CLEANUP_MAX_MB") {
            self.cleanup.auto_cleanup_max_mb = mb;
        }
        if let Some(difficulty) = env_u64("POW_DIFFICULTY") {
            self.server.pow_difficulty = difficulty.min(u32::MAX as u64) as u32;
        }
        if let Ok(domain) = std::env::var("R2_CDN_DOMAIN") {
            if !domain.is_empty() {
                self.server.cdn_domain = Some(domain);
            }
        }
        if let Ok(commit) = std::env::var("BUILD_COMMIT") {
            if !commit.is_empty() {
                self.build.commit = Some(commit);
            }
        }
        if let Ok(date) = std::env::var("BUILD_DATE") {
            if !date.is_empty() {
                self.build.date = Some(date);
            }
        }
    }

    /// Create a test configuration with filesystem storage under `root`.
    ///
    /// **For testing only.**
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::Filesystem {
                path: root.join("storage"),
            },
            tasks: TaskStoreConfig {
                path: root.join("tasks.db"),
            },
            cleanup: CleanupSettings::default(),
            build: BuildInfo::default(),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_difficulty_clamped() {
        let mut config = ServerConfig::default();
        assert_eq!(config.effective_pow_difficulty(), 18);
        config.pow_difficulty = 4;
        assert_eq!(config.effective_pow_difficulty(), 16);
        config.pow_difficulty = 99;
        assert_eq!(config.effective_pow_difficulty(), 24);
    }

    #[test]
    fn cdn_domain_validation() {
        let mut config = ServerConfig::default();
        assert_eq!(config.effective_cdn_domain(), None);
        config.cdn_domain = Some("cdn.example.com".to_string());
        assert_eq!(config.effective_cdn_domain(), Some("cdn.example.com"));
        config.cdn_domain = Some("evil.com/path".to_string());
        assert_eq!(config.effective_cdn_domain(), None);
        config.cdn_domain = Some(String::new());
        assert_eq!(config.effective_cdn_domain(), None);
    }

    #[test]
    fn storage_config_partial_credentials_rejected() {
        let invalid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn cleanup_settings_serde_field_names() {
        let settings = CleanupSettings {
            auto_cleanup_days: 7,
            auto_cleanup_max_mb: 1024,
        };
        let json = serde_json::to_value(settings).unwrap();
        assert_eq!(json["autoCleanupDays"], 7);
        assert_eq!(json["autoCleanupMaxMB"], 1024);
    }
}
