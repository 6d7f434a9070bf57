//! Workflow registry storage.
//!
//! `WorkflowStore` is the single owner of workflow, step and log records.
//! Callers hold an `Arc<dyn WorkflowStore>` and never keep their own copy
//! of a record beyond the scope of one operation.
//!
//! Consistency: reads observe every write made earlier in the same process,
//! and each `update` is atomic with respect to other `update`s.

mod memory;
mod db;

pub use self::memory::MemoryStore;
pub use self::db::RedbStore;

use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{IdpError, Result};
use crate::log::LogEntry;
use crate::types::WorkflowStatus;
use crate::workflow::Workflow;

/// Closure passed to [`WorkflowStore::update`]. Returning `Err` discards
/// the modification.
pub type Mutation<'a> = &'a mut dyn FnMut(&mut Workflow) -> Result<()>;

pub trait WorkflowStore: Send + Sync {
    /// Add a new record. Fails with `WorkflowExists` on id collision.
    fn insert(&self, workflow: &Workflow) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<Workflow>>;

    /// All records in insertion order.
    fn list(&self) -> Result<Vec<Workflow>>;

    /// Atomic read-modify-write; returns the stored result.
    fn update(&self, id: &str, mutate: Mutation<'_>) -> Result<Workflow>;

    fn append_log(&self, id: &str, entry: LogEntry) -> Result<()>;

    fn logs(&self, id: &str) -> Result<Vec<LogEntry>>;
}

/// Open the backend selected by `cfg`.
pub fn open(cfg: &StoreConfig, log_capacity: usize) -> Result<Arc<dyn WorkflowStore>> {
    match cfg.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(log_capacity))),
        StoreBackend::Redb => {
            let path = cfg
                .path
                .as_deref()
                .ok_or_else(|| IdpError::Store("store.path is required for redb".into()))?;
            Ok(Arc::new(RedbStore::open(path, log_capacity)?))
        }
    }
}

/// Message recorded on runs cut short by a process restart.
pub const INTERRUPTED: &str = "interrupted by restart";

/// Fail every running workflow that has no remote reference.
///
/// Such runs were executing in-process and cannot be resumed. Delegated
/// runs are left for the mirror. Returns the ids that were failed.
pub fn recover_interrupted(store: &dyn WorkflowStore) -> Result<Vec<String>> {
    let mut recovered = Vec::new();
    for wf in store.list()? {
        if wf.status != WorkflowStatus::Running || wf.remote_ref.is_some() {
            continue;
        }
        store.update(&wf.id, &mut |w| w.fail(INTERRUPTED))?;
        store.append_log(&wf.id, LogEntry::error(INTERRUPTED))?;
        recovered.push(wf.id);
    }
    Ok(recovered)
}
