//! Store and blob-store lifecycle enforcement.
//!
//! Three ordered phases over a single blob listing: age cap, size cap, and
//! an orphan sweep. Per-task errors are logged and never abort the
//! remaining phases.

use crate::metrics;
use crate::state::AppState;
use gantry_core::task::DownloadTask;
use gantry_core::{artifact_key, staging_key};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use time::{Duration, OffsetDateTime};

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, Default, Serialize)]
pub struct JanitorReport {
    #[serde(rename = "agedPurged")]
    pub aged_purged: usize,
    #[serde(rename = "quotaPurged")]
    pub quota_purged: usize,
    #[serde(rename = "orphansDeleted")]
    pub orphans_deleted: usize,
    #[serde(rename = "totalSizeMB")]
    pub total_size_mb: f64,
}

/// Run the janitor with the effective cleanup settings.
pub async fn run_janitor(state: &AppState) -> JanitorReport {
    let settings = state.cleanup_settings().await;
    run_with(
        state,
        settings.auto_cleanup_days,
        settings.auto_cleanup_max_mb,
    )
    .await
}

/// Run the janitor with explicit tunables. `days == 0` skips the age phase;
/// `max_mb == 0` skips the quota phase; the orphan sweep always runs.
pub async fn run_with(state: &AppState, days: u32, max_mb: u64) -> JanitorReport {
    let mut report = JanitorReport::default();

    // One listing shared by every phase.
    let mut sizes: HashMap<String, u64> = match state.storage.list("packages").await {
        Ok(entries) => entries.into_iter().map(|e| (e.key, e.size)).collect(),
        Err(e) => {
            tracing::error!(error = %e, "janitor blob listing failed, skipping run");
            return report;
        }
    };
    let mut total_size: u64 = sizes.values().sum();

    let mut tasks = match state.tasks.list_all_tasks().await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "janitor task listing failed, skipping run");
            return report;
        }
    };

    // Phase 1: age cap.
    if days > 0 {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(days as i64);
        let (expired, kept): (Vec<_>, Vec<_>) =
            tasks.into_iter().partition(|t| t.created_at < cutoff);
        tasks = kept;
        for task in expired {
            let id = task.id;
            match purge(state, &task, &mut sizes, &mut total_size).await {
                Ok(()) => report.aged_purged += 1,
                Err(e) => tracing::warn!(task_id = %id, error = %e, "age purge failed"),
            }
        }
    }

    // Phase 2: size cap, oldest first.
    if max_mb > 0 {
        let cap = max_mb * MIB;
        tasks.sort_by_key(|t| t.created_at);
        let mut remaining = tasks.iter();
        while total_size > cap {
            let Some(task) = remaining.next() else {
                break;
            };
            match purge(state, task, &mut sizes, &mut total_size).await {
                Ok(()) => report.quota_purged += 1,
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "quota purge failed"),
            }
        }
    }

    // Phase 3: orphan sweep. Anything not referenced by an `r2key:*` record
    // (including staging-key stragglers) goes.
    let referenced: HashSet<String> = match state.tasks.list_artifact_keys().await {
        Ok(keys) => keys.into_iter().collect(),
        Err(e) => {
            tracing::error!(error = %e, "janitor artifact-key listing failed, skipping sweep");
            report.total_size_mb = (total_size as f64) / (MIB as f64);
            return report;
        }
    };
    let orphans: Vec<String> = sizes
        .keys()
        .filter(|key| !referenced.contains(*key))
        .cloned()
        .collect();
    if !orphans.is_empty() {
        match state.storage.delete_batch(&orphans).await {
            Ok(outcome) => {
                report.orphans_deleted = outcome.deleted;
                for key in &orphans {
                    if let Some(size) = sizes.remove(key) {
                        total_size -= size;
                    }
                }
                if !outcome.failed.is_empty() {
                    tracing::warn!(failed = ?outcome.failed, "orphan sweep left stragglers");
                }
            }
            Err(e) => tracing::error!(error = %e, "orphan batch delete failed"),
        }
    }

    report.total_size_mb = (total_size as f64) / (MIB as f64);
    metrics::JANITOR_PURGED
        .inc_by((report.aged_purged + report.quota_purged + report.orphans_deleted) as u64);

    tracing::info!(
        aged = report.aged_purged,
        quota = report.quota_purged,
        orphans = report.orphans_deleted,
        total_size_mb = report.total_size_mb,
        "janitor run complete"
    );
    report
}

/// Cancel any in-flight download, delete every key the task may own, then
/// erase its records.
async fn purge(
    state: &AppState,
    task: &DownloadTask,
    sizes: &mut HashMap<String, u64>,
    total_size: &mut u64,
) -> Result<(), crate::error::ApiError> {
    state.downloads.cancel(task.id);

    let mut keys = BTreeSet::new();
    if let Some(stored) = state.tasks.get_r2_key_public(task.id).await? {
        keys.insert(staging_key(&stored));
        keys.insert(stored);
    }
    let deterministic = artifact_key(&task.account_hash, &task.software.bundle_id, task.id);
    keys.insert(staging_key(&deterministic));
    keys.insert(deterministic);

    let key_list: Vec<String> = keys.into_iter().collect();
    let outcome = state.storage.delete_batch(&key_list).await?;
    if !outcome.failed.is_empty() {
        tracing::warn!(task_id = %task.id, failed = ?outcome.failed, "purge delete incomplete");
    }
    for key in &key_list {
        if let Some(size) = sizes.remove(key) {
            *total_size -= size;
        }
    }

    state.tasks.purge_task(task.id).await?;
    Ok(())
}

/// Seconds until the next 02:00 UTC.
pub fn until_next_run(now: OffsetDateTime) -> std::time::Duration {
    let two_am = now.replace_time(time::Time::from_hms(2, 0, 0).expect("valid time"));
    let next = if now < two_am {
        two_am
    } else {
        two_am + Duration::days(1)
    };
    std::time::Duration::try_from(next - now).unwrap_or(std::time::Duration::from_secs(3600))
}
