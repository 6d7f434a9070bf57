//! Mapping from a remote workflow object's status onto local records.
//!
//! The remote engine reports a workflow phase plus a map of execution
//! nodes. `reconcile` applies both to a local `Workflow`, touching only what
//! actually differs so repeated polls of an unchanged object are no-ops.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::types::{StepStatus, WorkflowStatus};
use crate::workflow::{ObservedStep, Workflow};

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNode {
    pub display_name: String,
    pub template_name: Option<String>,
    pub phase: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteStatus {
    pub resource_version: Option<String>,
    pub phase: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub nodes: Vec<RemoteNode>,
}

fn str_at<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn time_at(v: &Value, key: &str) -> Option<DateTime<Utc>> {
    str_at(v, key)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

impl RemoteStatus {
    /// Read status from a full remote object (`metadata` + `status`).
    /// Missing fields are treated as empty, never as errors.
    pub fn from_object(obj: &Value) -> Self {
        let resource_version = obj
            .get("metadata")
            .and_then(|m| str_at(m, "resourceVersion"))
            .map(str::to_string);
        let Some(status) = obj.get("status") else {
            return Self {
                resource_version,
                ..Default::default()
            };
        };

        let mut nodes: Vec<RemoteNode> = status
            .get("nodes")
            .and_then(Value::as_object)
            .map(|nodes| {
                nodes
                    .values()
                    .map(|n| RemoteNode {
                        display_name: str_at(n, "displayName")
                            .or_else(|| str_at(n, "name"))
                            .unwrap_or_default()
                            .to_string(),
                        template_name: str_at(n, "templateName").map(str::to_string),
                        phase: str_at(n, "phase").unwrap_or_default().to_string(),
                        started_at: time_at(n, "startedAt"),
                        finished_at: time_at(n, "finishedAt"),
                        message: str_at(n, "message").map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        nodes.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        Self {
            resource_version,
            phase: str_at(status, "phase").unwrap_or_default().to_string(),
            started_at: time_at(status, "startedAt"),
            finished_at: time_at(status, "finishedAt"),
            message: str_at(status, "message").map(str::to_string),
            nodes,
        }
    }

    /// Latest node whose display or template name equals `step`.
    fn node_for(&self, step: &str) -> Option<&RemoteNode> {
        self.nodes
            .iter()
            .rev()
            .find(|n| n.display_name == step || n.template_name.as_deref() == Some(step))
    }
}

/// Remote workflow phase → local status.
pub fn map_phase(phase: &str) -> WorkflowStatus {
    match phase {
        "Succeeded" => WorkflowStatus::Succeeded,
        "Failed" | "Error" => WorkflowStatus::Failed,
        _ => WorkflowStatus::Running,
    }
}

/// Remote node phase → `(step status, skipped)`.
pub fn map_node_phase(phase: &str) -> (StepStatus, bool) {
    match phase {
        "Succeeded" => (StepStatus::Succeeded, false),
        "Skipped" | "Omitted" => (StepStatus::Succeeded, true),
        "Failed" | "Error" => (StepStatus::Failed, false),
        _ => (StepStatus::Running, false),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Names of steps whose record changed.
    pub steps_changed: Vec<String>,
    /// Set when the workflow moved to a terminal status.
    pub finished: Option<WorkflowStatus>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.steps_changed.is_empty() && self.finished.is_none()
    }
}

/// Apply `remote` to `workflow`. Terminal workflows are left untouched.
pub fn reconcile(
    workflow: &mut Workflow,
    remote: &RemoteStatus,
    now: DateTime<Utc>,
) -> Result<Reconciliation> {
    let mut out = Reconciliation::default();
    if workflow.is_terminal() {
        return Ok(out);
    }

    for index in 0..workflow.steps.len() {
        let name = workflow.steps[index].name.clone();
        let Some(node) = remote.node_for(&name) else {
            continue;
        };
        let (status, skipped) = map_node_phase(&node.phase);
        let observed = ObservedStep {
            status,
            started_at: node.started_at,
            ended_at: node.finished_at,
            skipped,
            error: if status == StepStatus::Failed {
                node.message.clone()
            } else {
                None
            },
        };
        if workflow.observe_step(index, &observed)? {
            out.steps_changed.push(name);
        }
    }

    let mapped = map_phase(&remote.phase);
    if mapped != workflow.status {
        let ended = remote.finished_at.unwrap_or(now);
        let error = match mapped {
            WorkflowStatus::Failed => Some(
                remote
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("remote workflow phase {}", remote.phase)),
            ),
            _ => None,
        };
        workflow.finish(mapped, ended, error)?;
        out.finished = Some(mapped);
    }
    Ok(out)
}
