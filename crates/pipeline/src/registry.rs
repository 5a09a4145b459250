//! Cancellation handles for in-flight downloads.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Map of task id → cancellation token for the owning download worker.
///
/// This is the only coupling between a running download and the rest of the
/// system: pause, delete, and the janitor all cancel through it.
#[derive(Default)]
pub struct DownloadRegistry {
    inner: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a task, replacing (and cancelling) any
    /// previous one.
    pub fn register(&self, id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .insert(id, token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    /// Cancel the download for a task, if one is in flight.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.inner.lock().expect("registry lock poisoned").get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a task's token. Called by the worker on exit.
    pub fn remove(&self, id: Uuid) {
        self.inner.lock().expect("registry lock poisoned").remove(&id);
    }

    /// Number of registered downloads (for metrics).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
