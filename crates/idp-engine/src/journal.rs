//! Store front used by every writer.
//!
//! `Journal` wraps the `WorkflowStore` and publishes a [`WorkflowEvent`] for
//! each change it writes, so push channels (SSE, WebSocket) see exactly what
//! the store sees.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use idp_core::log::LogEntry;
use idp_core::store::WorkflowStore;
use idp_core::workflow::{Step, Workflow};
use idp_core::{IdpError, Result};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowUpdated {
        workflow: Workflow,
    },
    StepUpdated {
        workflow_id: String,
        step: Step,
    },
    LogAppended {
        workflow_id: String,
        entry: LogEntry,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowUpdated { .. } => "workflow_updated",
            WorkflowEvent::StepUpdated { .. } => "step_updated",
            WorkflowEvent::LogAppended { .. } => "log_appended",
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::WorkflowUpdated { workflow } => &workflow.id,
            WorkflowEvent::StepUpdated { workflow_id, .. }
            | WorkflowEvent::LogAppended { workflow_id, .. } => workflow_id,
        }
    }
}

/// True when anything outside the step list differs.
fn header_changed(a: &Workflow, b: &Workflow) -> bool {
    a.status != b.status
        || a.ended_at != b.ended_at
        || a.error != b.error
        || a.remote_ref != b.remote_ref
        || a.retry_count != b.retry_count
        || a.abort_reason != b.abort_reason
}

#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn WorkflowStore>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl Journal {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: WorkflowEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn insert(&self, workflow: &Workflow) -> Result<()> {
        self.store.insert(workflow)?;
        self.publish(WorkflowEvent::WorkflowUpdated {
            workflow: workflow.clone(),
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Workflow> {
        self.store
            .get(id)?
            .ok_or_else(|| IdpError::WorkflowNotFound(id.to_string()))
    }

    /// Atomic update that publishes one event per changed step plus one for
    /// the workflow header if it changed.
    pub fn update(
        &self,
        id: &str,
        mut mutate: impl FnMut(&mut Workflow) -> Result<()>,
    ) -> Result<Workflow> {
        let mut before: Option<Workflow> = None;
        let after = self.store.update(id, &mut |w| {
            before = Some(w.clone());
            mutate(w)
        })?;
        let Some(before) = before else {
            return Ok(after);
        };

        for (old, new) in before.steps.iter().zip(&after.steps) {
            if old != new {
                self.publish(WorkflowEvent::StepUpdated {
                    workflow_id: after.id.clone(),
                    step: new.clone(),
                });
            }
        }
        if header_changed(&before, &after) {
            self.publish(WorkflowEvent::WorkflowUpdated {
                workflow: after.clone(),
            });
        }
        Ok(after)
    }

    /// Append to the workflow's log. Never fails the caller; store errors
    /// are reported through tracing.
    pub fn log(&self, id: &str, entry: LogEntry) {
        match self.store.append_log(id, entry.clone()) {
            Ok(()) => self.publish(WorkflowEvent::LogAppended {
                workflow_id: id.to_string(),
                entry,
            }),
            Err(e) => warn!(workflow = id, error = %e, "failed to append log entry"),
        }
    }

    pub fn info(&self, id: &str, message: impl Into<String>) {
        self.log(id, LogEntry::info(message));
    }

    pub fn warn(&self, id: &str, message: impl Into<String>) {
        self.log(id, LogEntry::warn(message));
    }

    pub fn error(&self, id: &str, message: impl Into<String>) {
        self.log(id, LogEntry::error(message));
    }

    pub fn debug(&self, id: &str, message: impl Into<String>) {
        self.log(id, LogEntry::debug(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idp_core::store::MemoryStore;
    use idp_core::types::WorkflowType;
    use serde_json::Map;

    fn journal() -> Journal {
        Journal::new(Arc::new(MemoryStore::new(100)))
    }

    #[tokio::test]
    async fn update_publishes_step_and_header_events() {
        let j = journal();
        let wf = Workflow::new(WorkflowType::NamespaceDeletion, "ns", Map::new(), false);
        j.insert(&wf).unwrap();
        let mut rx = j.subscribe();

        j.update(&wf.id, |w| w.start_step(0)).unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "step_updated");
        assert!(rx.try_recv().is_err(), "header unchanged");

        j.update(&wf.id, |w| w.fail("boom")).unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "workflow_updated");
        assert_eq!(ev.workflow_id(), wf.id);
    }

    #[tokio::test]
    async fn failed_update_publishes_nothing() {
        let j = journal();
        let wf = Workflow::new(WorkflowType::NamespaceDeletion, "ns", Map::new(), false);
        j.insert(&wf).unwrap();
        let mut rx = j.subscribe();
        assert!(j.update(&wf.id, |w| w.retry()).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn log_to_unknown_workflow_is_swallowed() {
        let j = journal();
        let mut rx = j.subscribe();
        j.info("missing", "hello");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn event_serialises_with_type_tag() {
        let ev = WorkflowEvent::LogAppended {
            workflow_id: "abc".into(),
            entry: LogEntry::info("hi"),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "log_appended");
        assert_eq!(v["workflow_id"], "abc");
        assert_eq!(v["entry"]["message"], "hi");
    }
}
