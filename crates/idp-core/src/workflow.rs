//! Workflow and step records plus their state machine.
//!
//! A `Workflow` owns its ordered `Step` list. Every mutation goes through a
//! method here so the transition rules live in one place:
//!
//! ```text
//! running ──► succeeded
//!    │  ──► aborted
//!    └────► failed ──retry──► running
//! ```
//!
//! Once a workflow is terminal its steps are frozen; step mutators return
//! `IdpError::WorkflowTerminal`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{IdpError, Result};
use crate::types::{StepEffect, StepStatus, WorkflowStatus, WorkflowType};

// ---------------------------------------------------------------------------
// Step catalogue
// ---------------------------------------------------------------------------

/// A named step in the fixed ordering of a workflow type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSpec {
    pub name: &'static str,
    pub effect: StepEffect,
}

const fn local(name: &'static str) -> StepSpec {
    StepSpec {
        name,
        effect: StepEffect::Local,
    }
}

const fn external(name: &'static str) -> StepSpec {
    StepSpec {
        name,
        effect: StepEffect::External,
    }
}

pub const VALIDATE_PARAMETERS: &str = "validate-parameters";
pub const CREATE_RESOURCE_GROUP: &str = "create-resource-group";
pub const CREATE_MANAGED_CLUSTER: &str = "create-managed-cluster";
pub const WAIT_FOR_CLUSTER_READY: &str = "wait-for-cluster-ready";
pub const CONFIGURE_GITOPS: &str = "configure-gitops";
pub const DELETE_MANAGED_CLUSTER: &str = "delete-managed-cluster";
pub const DELETE_RESOURCE_GROUP: &str = "delete-resource-group";
pub const CLEANUP_RECORDS: &str = "cleanup-records";
pub const CREATE_NAMESPACE: &str = "create-namespace";
pub const UPDATE_NAMESPACE: &str = "update-namespace";
pub const APPLY_RESOURCE_QUOTA: &str = "apply-resource-quota";
pub const APPLY_NETWORK_POLICY: &str = "apply-network-policy";
pub const DELETE_NAMESPACE: &str = "delete-namespace";

const CLUSTER_PROVISIONING: &[StepSpec] = &[
    local(VALIDATE_PARAMETERS),
    external(CREATE_RESOURCE_GROUP),
    external(CREATE_MANAGED_CLUSTER),
    external(WAIT_FOR_CLUSTER_READY),
    external(CONFIGURE_GITOPS),
];

const CLUSTER_DELETION: &[StepSpec] = &[
    local(VALIDATE_PARAMETERS),
    external(DELETE_MANAGED_CLUSTER),
    external(DELETE_RESOURCE_GROUP),
    local(CLEANUP_RECORDS),
];

const NAMESPACE_PROVISIONING: &[StepSpec] = &[
    local(VALIDATE_PARAMETERS),
    external(CREATE_NAMESPACE),
    external(APPLY_RESOURCE_QUOTA),
    external(APPLY_NETWORK_POLICY),
];

const NAMESPACE_UPDATE: &[StepSpec] = &[
    local(VALIDATE_PARAMETERS),
    external(UPDATE_NAMESPACE),
    external(APPLY_RESOURCE_QUOTA),
];

const NAMESPACE_DELETION: &[StepSpec] = &[
    local(VALIDATE_PARAMETERS),
    external(DELETE_NAMESPACE),
    local(CLEANUP_RECORDS),
];

/// The canonical step order for a workflow type.
pub fn catalogue(workflow_type: WorkflowType) -> &'static [StepSpec] {
    match workflow_type {
        WorkflowType::ClusterProvisioning => CLUSTER_PROVISIONING,
        WorkflowType::ClusterDeletion => CLUSTER_DELETION,
        WorkflowType::NamespaceProvisioning => NAMESPACE_PROVISIONING,
        WorkflowType::NamespaceUpdate => NAMESPACE_UPDATE,
        WorkflowType::NamespaceDeletion => NAMESPACE_DELETION,
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when dry-run (or the remote engine) skipped the step.
    #[serde(default)]
    pub skipped: bool,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            skipped: false,
        }
    }
}

/// A step status observed from outside the process (the remote engine).
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedStep {
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub skipped: bool,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub dry_run: bool,
    /// Name of the remote workflow object, when execution is delegated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Create a running workflow with the full canonical step list.
    pub fn new(
        workflow_type: WorkflowType,
        name: impl Into<String>,
        parameters: Map<String, Value>,
        dry_run: bool,
    ) -> Self {
        let steps = catalogue(workflow_type)
            .iter()
            .map(|spec| Step::new(spec.name))
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            workflow_type,
            status: WorkflowStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            parameters,
            dry_run,
            remote_ref: None,
            retry_count: 0,
            abort_reason: None,
            steps,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// `(succeeded, total)` step counts.
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count();
        (done, self.steps.len())
    }

    /// Index of the first step that has not succeeded, if any.
    pub fn next_pending_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Succeeded)
    }

    // -----------------------------------------------------------------------
    // Workflow transitions
    // -----------------------------------------------------------------------

    fn transition(&self, to: WorkflowStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (WorkflowStatus::Running, WorkflowStatus::Succeeded)
                | (WorkflowStatus::Running, WorkflowStatus::Failed)
                | (WorkflowStatus::Running, WorkflowStatus::Aborted)
                | (WorkflowStatus::Failed, WorkflowStatus::Running)
        );
        if allowed {
            Ok(())
        } else {
            Err(IdpError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
                reason: match to {
                    WorkflowStatus::Running => "only failed workflows can be retried".into(),
                    _ => "workflow is no longer running".into(),
                },
            })
        }
    }

    /// Move a running workflow to a terminal status at `at`.
    pub fn finish(
        &mut self,
        status: WorkflowStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()> {
        if status == WorkflowStatus::Running {
            return Err(IdpError::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
                reason: "finish requires a terminal status".into(),
            });
        }
        self.transition(status)?;
        self.status = status;
        self.ended_at = Some(at);
        if error.is_some() {
            self.error = error;
        }
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.finish(WorkflowStatus::Succeeded, Utc::now(), None)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.finish(WorkflowStatus::Failed, Utc::now(), Some(error.into()))
    }

    pub fn abort(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.finish(WorkflowStatus::Aborted, Utc::now(), None)?;
        self.abort_reason = Some(reason);
        Ok(())
    }

    /// Re-enter `running` from `failed`.
    ///
    /// Keeps the id, bumps `retry_count` by one, and resets every step that
    /// has not succeeded back to pending so execution can resume.
    pub fn retry(&mut self) -> Result<()> {
        self.transition(WorkflowStatus::Running)?;
        self.status = WorkflowStatus::Running;
        self.retry_count += 1;
        self.ended_at = None;
        self.error = None;
        for step in &mut self.steps {
            if step.status != StepStatus::Succeeded {
                step.status = StepStatus::Pending;
                step.started_at = None;
                step.ended_at = None;
                step.error = None;
                step.skipped = false;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step transitions
    // -----------------------------------------------------------------------

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(IdpError::WorkflowTerminal(self.id.clone()));
        }
        Ok(())
    }

    fn step_mut(&mut self, index: usize) -> Result<&mut Step> {
        let id = self.id.clone();
        self.steps
            .get_mut(index)
            .ok_or_else(|| IdpError::StepNotFound(format!("{id}#{index}")))
    }

    /// Mark step `index` running. Every earlier step must have succeeded.
    pub fn start_step(&mut self, index: usize) -> Result<()> {
        self.ensure_mutable()?;
        if let Some(blocker) = self.steps[..index.min(self.steps.len())]
            .iter()
            .find(|s| s.status != StepStatus::Succeeded)
        {
            let step = self
                .steps
                .get(index)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            return Err(IdpError::StepOutOfOrder {
                step,
                blocked_by: blocker.name.clone(),
            });
        }
        let step = self.step_mut(index)?;
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.ended_at = None;
        step.error = None;
        Ok(())
    }

    pub fn succeed_step(&mut self, index: usize, skipped: bool) -> Result<()> {
        self.ensure_mutable()?;
        let step = self.step_mut(index)?;
        let now = Utc::now();
        step.status = StepStatus::Succeeded;
        step.started_at.get_or_insert(now);
        step.ended_at = Some(now);
        step.skipped = skipped;
        Ok(())
    }

    pub fn fail_step(&mut self, index: usize, error: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        let step = self.step_mut(index)?;
        let now = Utc::now();
        step.status = StepStatus::Failed;
        step.started_at.get_or_insert(now);
        step.ended_at = Some(now);
        step.error = Some(error.into());
        Ok(())
    }

    /// Apply an externally observed step state. Returns `true` if anything
    /// changed.
    pub fn observe_step(&mut self, index: usize, observed: &ObservedStep) -> Result<bool> {
        self.ensure_mutable()?;
        let step = self.step_mut(index)?;
        let before = step.clone();
        step.status = observed.status;
        if observed.started_at.is_some() {
            step.started_at = observed.started_at;
        }
        match observed.status {
            StepStatus::Succeeded | StepStatus::Failed => {
                step.ended_at = observed.ended_at.or(step.ended_at).or(Some(Utc::now()));
            }
            StepStatus::Pending | StepStatus::Running => step.ended_at = None,
        }
        step.skipped = observed.skipped;
        if observed.error.is_some() {
            step.error = observed.error.clone();
        }
        Ok(*step != before)
    }
}
