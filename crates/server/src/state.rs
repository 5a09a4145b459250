//! Application state shared across handlers.

use crate::pow::PowGate;
use gantry_core::config::{AppConfig, CleanupSettings};
use gantry_pipeline::{DownloadEngine, DownloadRegistry};
use gantry_storage::ObjectStore;
use gantry_tasks::TaskStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Artifact blob store.
    pub storage: Arc<dyn ObjectStore>,
    /// Task store (single-writer).
    pub tasks: Arc<TaskStore>,
    /// Download engine shared by create/resume handlers.
    pub engine: Arc<DownloadEngine>,
    /// Cancellation handles for in-flight downloads.
    pub downloads: Arc<DownloadRegistry>,
    /// Proof-of-work gate with the process-ephemeral key.
    pub pow: Arc<PowGate>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        tasks: Arc<TaskStore>,
    ) -> Self {
        let downloads = Arc::new(DownloadRegistry::new());
        let engine = Arc::new(DownloadEngine::new(
            Arc::clone(&storage),
            Arc::clone(&tasks),
            Arc::clone(&downloads),
        ));
        let pow = Arc::new(PowGate::new(config.server.effective_pow_difficulty()));

        Self {
            config: Arc::new(config),
            storage,
            tasks,
            engine,
            downloads,
            pow,
        }
    }

    /// Cleanup tunables: persisted settings override the environment
    /// defaults.
    pub async fn cleanup_settings(&self) -> CleanupSettings {
        match self.tasks.get_cleanup_settings().await {
            Ok(Some(settings)) => settings,
            Ok(None) => self.config.cleanup,
            Err(e) => {
                tracing::warn!(error = %e, "reading cleanup settings failed, using defaults");
                self.config.cleanup
            }
        }
    }
}
