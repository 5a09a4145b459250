//! SQLite-backed task store.
//!
//! Persistent state is a single `kv` table holding the keyed records:
//! `task:<id>`, `r2key:<id>`, `accounts:<hash>`, `config:*`, and
//! `auth:password_hash`. The pool is capped at one connection and every
//! mutating RPC runs inside one transaction, which serializes all mutations
//! against the store instance.

use crate::error::{TaskStoreError, TaskStoreResult};
use gantry_core::config::CleanupSettings;
use gantry_core::task::{DownloadTask, SanitizedTask, Sinf, Software, TaskStatus};
use gantry_core::validate::{validate_account_hash, validate_bundle_id, validate_download_url};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

const TASK_PREFIX: &str = "task:";
const R2KEY_PREFIX: &str = "r2key:";
const ACCOUNTS_PREFIX: &str = "accounts:";
const CONFIG_DAYS_KEY: &str = "config:autoCleanupDays";
const CONFIG_MAX_MB_KEY: &str = "config:autoCleanupMaxMB";
const PASSWORD_HASH_KEY: &str = "auth:password_hash";

/// Parameters for task creation.
#[derive(Clone, Debug)]
pub struct NewTaskParams {
    pub software: Software,
    pub account_hash: String,
    pub download_url: String,
    pub sinfs: Vec<Sinf>,
    pub itunes_metadata: Option<String>,
}

/// Single-writer task store over SQLite.
pub struct TaskStore {
    pool: Pool<Sqlite>,
}

impl TaskStore {
    /// Open (or create) the store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> TaskStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        // A single connection gives the single-writer discipline: no two
        // mutating RPCs can execute concurrently against this store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> TaskStoreResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Task RPCs =====

    /// Validate, deduplicate, and persist a new task.
    ///
    /// Returns the raw record so the caller can hand the download engine its
    /// secrets; the HTTP layer only ever serializes the sanitized form.
    pub async fn create_task(&self, params: NewTaskParams) -> TaskStoreResult<DownloadTask> {
        validate_account_hash(&params.account_hash)?;
        validate_bundle_id(&params.software.bundle_id)?;
        validate_download_url(&params.download_url)?;

        let mut tx = self.pool.begin().await?;

        // At most one non-failed task per (accountHash, bundleID, version).
        let ids = account_ids(&mut *tx, &params.account_hash).await?;
        for id in &ids {
            if let Some(existing) = load_task(&mut *tx, *id).await? {
                if existing.status != TaskStatus::Failed
                    && existing.software.bundle_id == params.software.bundle_id
                    && existing.software.version == params.software.version
                {
                    return Err(TaskStoreError::Conflict(format!(
                        "a task for {} {} already exists",
                        params.software.bundle_id, params.software.version
                    )));
                }
            }
        }

        let task = DownloadTask {
            id: Uuid::new_v4(),
            software: params.software,
            account_hash: params.account_hash.clone(),
            download_url: Some(params.download_url),
            sinfs: params.sinfs,
            itunes_metadata: params.itunes_metadata,
            status: TaskStatus::Pending,
            progress: 0,
            speed: "0 B/s".to_string(),
            error: None,
            created_at: OffsetDateTime::now_utc(),
            file_size: None,
        };

        store_task(&mut *tx, &task).await?;
        let mut ids = ids;
        ids.push(task.id);
        store_account_ids(&mut *tx, &params.account_hash, &ids).await?;
        tx.commit().await?;

        Ok(task)
    }

    /// Tenant-checked sanitized lookup. Missing and foreign tasks are
    /// indistinguishable.
    pub async fn get_task(
        &self,
        id: Uuid,
        account_hash: &str,
    ) -> TaskStoreResult<Option<SanitizedTask>> {
        Ok(self
            .get_task_owned(id, account_hash)
            .await?
            .map(|t| t.sanitized()))
    }

    /// Tenant-checked raw lookup for internal orchestration.
    pub async fn get_task_owned(
        &self,
        id: Uuid,
        account_hash: &str,
    ) -> TaskStoreResult<Option<DownloadTask>> {
        let mut conn = self.pool.acquire().await?;
        let task = load_task(&mut *conn, id).await?;
        Ok(task.filter(|t| t.account_hash == account_hash))
    }

    /// Raw lookup without a tenant check. Internal use only (engine, janitor).
    pub async fn get_task_raw(&self, id: Uuid) -> TaskStoreResult<Option<DownloadTask>> {
        let mut conn = self.pool.acquire().await?;
        load_task(&mut *conn, id).await
    }

    /// Union of the tenants' task lists, in index order.
    pub async fn list_tasks(&self, account_hashes: &[String]) -> TaskStoreResult<Vec<SanitizedTask>> {
        let mut conn = self.pool.acquire().await?;
        let mut out = Vec::new();
        for hash in account_hashes {
            for id in account_ids(&mut *conn, hash).await? {
                if let Some(task) = load_task(&mut *conn, id).await? {
                    out.push(task.sanitized());
                }
            }
        }
        Ok(out)
    }

    /// `downloading` → `paused`. Returns false for any other state or a
    /// tenant mismatch. The caller signals cancellation to the engine.
    pub async fn pause_task(&self, id: Uuid, account_hash: &str) -> TaskStoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(mut task) = load_task(&mut *tx, id).await? else {
            return Ok(false);
        };
        if task.account_hash != account_hash || task.status != TaskStatus::Downloading {
            return Ok(false);
        }
        task.status = TaskStatus::Paused;
        task.speed = "0 B/s".to_string();
        store_task(&mut *tx, &task).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// `paused` → `downloading`. Returns the raw record (the caller restarts
    /// the download from scratch), or None if the transition does not apply.
    pub async fn resume_task(
        &self,
        id: Uuid,
        account_hash: &str,
    ) -> TaskStoreResult<Option<DownloadTask>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut task) = load_task(&mut *tx, id).await? else {
            return Ok(None);
        };
        if task.account_hash != account_hash || task.status != TaskStatus::Paused {
            return Ok(None);
        }
        task.status = TaskStatus::Downloading;
        task.progress = 0;
        task.error = None;
        store_task(&mut *tx, &task).await?;
        tx.commit().await?;
        Ok(Some(task))
    }

    /// Erase `task:<id>`, `r2key:<id>`, and the account-index entry.
    ///
    /// Used by the delete RPC and the janitor, after the caller has cancelled
    /// any in-flight download and deleted the stored artifacts.
    pub async fn purge_task(&self, id: Uuid) -> TaskStoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let task = load_task(&mut *tx, id).await?;

        kv_delete(&mut *tx, &format!("{TASK_PREFIX}{id}")).await?;
        kv_delete(&mut *tx, &format!("{R2KEY_PREFIX}{id}")).await?;

        if let Some(task) = task {
            let ids = account_ids(&mut *tx, &task.account_hash).await?;
            let remaining: Vec<Uuid> = ids.into_iter().filter(|i| *i != id).collect();
            store_account_ids(&mut *tx, &task.account_hash, &remaining).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ===== Engine mutators =====

    /// Compare-and-set status transition. Returns false when the current
    /// status is not `expected` (e.g., the task was paused mid-flight).
    pub async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> TaskStoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(mut task) = load_task(&mut *tx, id).await? else {
            return Ok(false);
        };
        if task.status != expected {
            return Ok(false);
        }
        task.status = next;
        store_task(&mut *tx, &task).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Throttled progress update from the download engine.
    pub async fn set_progress(&self, id: Uuid, progress: u8, speed: &str) -> TaskStoreResult<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(mut task) = load_task(&mut *tx, id).await? {
            task.progress = progress.min(100);
            task.speed = speed.to_string();
            store_task(&mut *tx, &task).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Terminal failure: keep the record so the tenant can see and delete it.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> TaskStoreResult<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(mut task) = load_task(&mut *tx, id).await? {
            task.status = TaskStatus::Failed;
            task.speed = "0 B/s".to_string();
            task.error = Some(error.to_string());
            store_task(&mut *tx, &task).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Terminal success: record the artifact key and size, clear the secret
    /// fields, and set `completed` in a single transaction so the
    /// `completed ⇔ r2key` invariant holds between RPCs.
    pub async fn mark_completed(
        &self,
        id: Uuid,
        artifact_key: &str,
        file_size: u64,
    ) -> TaskStoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let Some(mut task) = load_task(&mut *tx, id).await? else {
            return Err(TaskStoreError::NotFound(id.to_string()));
        };
        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.speed = "0 B/s".to_string();
        task.error = None;
        task.file_size = Some(file_size);
        task.clear_secrets();
        store_task(&mut *tx, &task).await?;
        kv_put(&mut *tx, &format!("{R2KEY_PREFIX}{id}"), artifact_key).await?;
        tx.commit().await?;
        Ok(())
    }

    // ===== Public-by-UUID lookups =====

    /// Sanitized lookup without a tenant check; installation URLs are
    /// unguessable UUIDs.
    pub async fn get_task_public(&self, id: Uuid) -> TaskStoreResult<Option<SanitizedTask>> {
        Ok(self.get_task_raw(id).await?.map(|t| t.sanitized()))
    }

    /// Artifact key for a completed task, without a tenant check.
    pub async fn get_r2_key_public(&self, id: Uuid) -> TaskStoreResult<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        kv_get(&mut *conn, &format!("{R2KEY_PREFIX}{id}")).await
    }

    // ===== Janitor support =====

    /// Every stored task record.
    pub async fn list_all_tasks(&self) -> TaskStoreResult<Vec<DownloadTask>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT value FROM kv WHERE key LIKE 'task:%'")
                .fetch_all(&self.pool)
                .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for (value,) in rows {
            match serde_json::from_str::<DownloadTask>(&value) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable task record"),
            }
        }
        Ok(tasks)
    }

    /// Every `r2key:*` value, for the orphan sweep.
    pub async fn list_artifact_keys(&self) -> TaskStoreResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT value FROM kv WHERE key LIKE 'r2key:%'")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    // ===== Config =====

    pub async fn get_cleanup_settings(&self) -> TaskStoreResult<Option<CleanupSettings>> {
        let mut conn = self.pool.acquire().await?;
        let days = kv_get(&mut *conn, CONFIG_DAYS_KEY).await?;
        let max_mb = kv_get(&mut *conn, CONFIG_MAX_MB_KEY).await?;
        match (days, max_mb) {
            (None, None) => Ok(None),
            (days, max_mb) => Ok(Some(CleanupSettings {
                auto_cleanup_days: days.and_then(|v| v.parse().ok()).unwrap_or(0),
                auto_cleanup_max_mb: max_mb.and_then(|v| v.parse().ok()).unwrap_or(0),
            })),
        }
    }

    pub async fn set_cleanup_settings(&self, settings: CleanupSettings) -> TaskStoreResult<()> {
        let mut tx = self.pool.begin().await?;
        kv_put(
            &mut *tx,
            CONFIG_DAYS_KEY,
            &settings.auto_cleanup_days.to_string(),
        )
        .await?;
        kv_put(
            &mut *tx,
            CONFIG_MAX_MB_KEY,
            &settings.auto_cleanup_max_mb.to_string(),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ===== Auth =====

    pub async fn get_password_hash(&self) -> TaskStoreResult<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        kv_get(&mut *conn, PASSWORD_HASH_KEY).await
    }

    pub async fn set_password_hash(&self, hash: &str) -> TaskStoreResult<()> {
        let mut tx = self.pool.begin().await?;
        kv_put(&mut *tx, PASSWORD_HASH_KEY, hash).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Compare-and-set used during initial setup. Returns false if a hash is
    /// already present.
    pub async fn set_password_hash_if_absent(&self, hash: &str) -> TaskStoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        if kv_get(&mut *tx, PASSWORD_HASH_KEY).await?.is_some() {
            return Ok(false);
        }
        kv_put(&mut *tx, PASSWORD_HASH_KEY, hash).await?;
        tx.commit().await?;
        Ok(true)
    }
}

// ===== kv helpers (used inside transactions and single reads) =====

async fn kv_get(conn: &mut SqliteConnection, key: &str) -> TaskStoreResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?1")
        .bind(key)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(|(v,)| v))
}

async fn kv_put(conn: &mut SqliteConnection, key: &str, value: &str) -> TaskStoreResult<()> {
    sqlx::query(
        "INSERT INTO kv (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(conn)
    .await?;
    Ok(())
}

async fn kv_delete(conn: &mut SqliteConnection, key: &str) -> TaskStoreResult<()> {
    sqlx::query("DELETE FROM kv WHERE key = ?1")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

async fn load_task(conn: &mut SqliteConnection, id: Uuid) -> TaskStoreResult<Option<DownloadTask>> {
    match kv_get(conn, &format!("{TASK_PREFIX}{id}")).await? {
        Some(value) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}

async fn store_task(conn: &mut SqliteConnection, task: &DownloadTask) -> TaskStoreResult<()> {
    let value = serde_json::to_string(task)?;
    kv_put(conn, &format!("{TASK_PREFIX}{}", task.id), &value).await
}

async fn account_ids(conn: &mut SqliteConnection, hash: &str) -> TaskStoreResult<Vec<Uuid>> {
    match kv_get(conn, &format!("{ACCOUNTS_PREFIX}{hash}")).await? {
        Some(value) => Ok(serde_json::from_str(&value)?),
        None => Ok(Vec::new()),
    }
}

async fn store_account_ids(
    conn: &mut SqliteConnection,
    hash: &str,
    ids: &[Uuid],
) -> TaskStoreResult<()> {
    if ids.is_empty() {
        kv_delete(conn, &format!("{ACCOUNTS_PREFIX}{hash}")).await
    } else {
        let value = serde_json::to_string(ids)?;
        kv_put(conn, &format!("{ACCOUNTS_PREFIX}{hash}"), &value).await
    }
}
