use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{IdpError, Result};
use crate::log::{LogBuffer, LogEntry};
use crate::workflow::Workflow;

use super::{Mutation, WorkflowStore};

#[derive(Default)]
struct Inner {
    order: Vec<String>,
    workflows: HashMap<String, Workflow>,
    logs: HashMap<String, LogBuffer>,
}

/// Process-memory store. State is lost on restart.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    log_capacity: usize,
}

impl MemoryStore {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            log_capacity,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|e| IdpError::Store(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|e| IdpError::Store(e.to_string()))
    }
}

impl WorkflowStore for MemoryStore {
    fn insert(&self, workflow: &Workflow) -> Result<()> {
        let mut inner = self.write()?;
        if inner.workflows.contains_key(&workflow.id) {
            return Err(IdpError::WorkflowExists(workflow.id.clone()));
        }
        inner.order.push(workflow.id.clone());
        inner
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.read()?.workflows.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Workflow>> {
        let inner = self.read()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.workflows.get(id).cloned())
            .collect())
    }

    fn update(&self, id: &str, mutate: Mutation<'_>) -> Result<Workflow> {
        let mut inner = self.write()?;
        let current = inner
            .workflows
            .get(id)
            .ok_or_else(|| IdpError::WorkflowNotFound(id.to_string()))?;
        let mut next = current.clone();
        mutate(&mut next)?;
        inner.workflows.insert(id.to_string(), next.clone());
        Ok(next)
    }

    fn append_log(&self, id: &str, entry: LogEntry) -> Result<()> {
        let mut inner = self.write()?;
        if !inner.workflows.contains_key(id) {
            return Err(IdpError::WorkflowNotFound(id.to_string()));
        }
        let capacity = self.log_capacity;
        inner
            .logs
            .entry(id.to_string())
            .or_default()
            .push(entry, capacity);
        Ok(())
    }

    fn logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        let inner = self.read()?;
        if !inner.workflows.contains_key(id) {
            return Err(IdpError::WorkflowNotFound(id.to_string()));
        }
        Ok(inner
            .logs
            .get(id)
            .map(LogBuffer::snapshot)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WorkflowStatus, WorkflowType};
    use serde_json::Map;

    fn wf(name: &str) -> Workflow {
        Workflow::new(WorkflowType::ClusterDeletion, name, Map::new(), false)
    }

    #[test]
    fn list_preserves_insertion_order() {
        let store = MemoryStore::new(10);
        for name in ["c", "a", "b"] {
            store.insert(&wf(name)).unwrap();
        }
        let names: Vec<_> = store.list().unwrap().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new(10);
        let w = wf("x");
        store.insert(&w).unwrap();
        assert!(matches!(
            store.insert(&w),
            Err(IdpError::WorkflowExists(_))
        ));
    }

    #[test]
    fn failed_mutation_leaves_record_unchanged() {
        let store = MemoryStore::new(10);
        let w = wf("x");
        store.insert(&w).unwrap();
        store.update(&w.id, &mut |w| w.succeed()).unwrap();

        // succeeded → failed is not allowed; nothing is written
        let err = store.update(&w.id, &mut |w| {
            w.name = "renamed".into();
            w.fail("late")
        });
        assert!(err.is_err());
        let stored = store.get(&w.id).unwrap().unwrap();
        assert_eq!(stored.name, "x");
        assert_eq!(stored.status, WorkflowStatus::Succeeded);
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let store = MemoryStore::new(10);
        let err = store.update("nope", &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, IdpError::WorkflowNotFound(_)));
    }

    #[test]
    fn logs_are_capped_per_workflow() {
        let store = MemoryStore::new(2);
        let a = wf("a");
        let b = wf("b");
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();
        for i in 0..4 {
            store.append_log(&a.id, LogEntry::info(format!("a{i}"))).unwrap();
        }
        store.append_log(&b.id, LogEntry::info("b0")).unwrap();

        let a_logs: Vec<_> = store
            .logs(&a.id)
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(a_logs, vec!["a2", "a3"]);
        assert_eq!(store.logs(&b.id).unwrap().len(), 1);
    }
}
