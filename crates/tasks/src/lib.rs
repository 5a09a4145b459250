//! Persistent task store for Gantry.
//!
//! Keyed records over SQLite with single-writer semantics: task records,
//! per-tenant indexes, artifact-key mappings, cleanup config, and the
//! password hash.

pub mod error;
pub mod store;

pub use error::{TaskStoreError, TaskStoreResult};
pub use store::{NewTaskParams, TaskStore};
