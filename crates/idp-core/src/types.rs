use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::IdpError;

// ---------------------------------------------------------------------------
// WorkflowType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    ClusterProvisioning,
    ClusterDeletion,
    NamespaceProvisioning,
    NamespaceUpdate,
    NamespaceDeletion,
}

impl WorkflowType {
    pub fn all() -> &'static [WorkflowType] {
        &[
            WorkflowType::ClusterProvisioning,
            WorkflowType::ClusterDeletion,
            WorkflowType::NamespaceProvisioning,
            WorkflowType::NamespaceUpdate,
            WorkflowType::NamespaceDeletion,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowType::ClusterProvisioning => "cluster-provisioning",
            WorkflowType::ClusterDeletion => "cluster-deletion",
            WorkflowType::NamespaceProvisioning => "namespace-provisioning",
            WorkflowType::NamespaceUpdate => "namespace-update",
            WorkflowType::NamespaceDeletion => "namespace-deletion",
        }
    }

    /// Short prefix used when naming remote workflow objects.
    pub fn prefix(self) -> &'static str {
        match self {
            WorkflowType::ClusterProvisioning => "cp",
            WorkflowType::ClusterDeletion => "cd",
            WorkflowType::NamespaceProvisioning => "np",
            WorkflowType::NamespaceUpdate => "nu",
            WorkflowType::NamespaceDeletion => "nd",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = IdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster-provisioning" => Ok(WorkflowType::ClusterProvisioning),
            "cluster-deletion" => Ok(WorkflowType::ClusterDeletion),
            "namespace-provisioning" => Ok(WorkflowType::NamespaceProvisioning),
            "namespace-update" => Ok(WorkflowType::NamespaceUpdate),
            "namespace-deletion" => Ok(WorkflowType::NamespaceDeletion),
            _ => Err(IdpError::InvalidWorkflowType(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow.
///
/// Transitions: `Running → Succeeded | Failed | Aborted`, plus the explicit
/// retry edge `Failed → Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    #[serde(alias = "completed")]
    Succeeded,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = IdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkflowStatus::Running),
            "succeeded" | "completed" => Ok(WorkflowStatus::Succeeded),
            "failed" => Ok(WorkflowStatus::Failed),
            "aborted" => Ok(WorkflowStatus::Aborted),
            _ => Err(IdpError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepEffect
// ---------------------------------------------------------------------------

/// Whether a step touches infrastructure. `External` steps are skipped in
/// dry-run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEffect {
    Local,
    External,
}

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
