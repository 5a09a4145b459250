//! Throttled progress reporting.

use gantry_tasks::TaskStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Minimum interval between task-record progress writes.
const REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Humanize a byte rate.
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    if bytes_per_sec >= MB {
        format!("{:.1} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.1} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

/// Writes `speed` and `progress` onto the task record at most once per
/// [`REPORT_INTERVAL`].
pub struct ProgressReporter {
    store: Arc<TaskStore>,
    task_id: Uuid,
    last_report: Instant,
    last_bytes: u64,
}

impl ProgressReporter {
    pub fn new(store: Arc<TaskStore>, task_id: Uuid) -> Self {
        Self {
            store,
            task_id,
            last_report: Instant::now(),
            last_bytes: 0,
        }
    }

    /// Report if the throttle window has elapsed. Write failures are logged
    /// and ignored; progress is advisory.
    pub async fn tick(&mut self, downloaded: u64, total: Option<u64>) {
        let elapsed = self.last_report.elapsed();
        if elapsed < REPORT_INTERVAL {
            return;
        }

        let rate = (downloaded - self.last_bytes) as f64 / elapsed.as_secs_f64();
        let progress = match total {
            Some(total) if total > 0 => ((downloaded * 100) / total).min(100) as u8,
            _ => 0,
        };

        if let Err(e) = self
            .store
            .set_progress(self.task_id, progress, &format_speed(rate))
            .await
        {
            tracing::warn!(task_id = %self.task_id, error = %e, "progress update failed");
        }

        self.last_report = Instant::now();
        self.last_bytes = downloaded;
    }
}
