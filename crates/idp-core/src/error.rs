use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdpError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow already exists: {0}")]
    WorkflowExists(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("unknown workflow type: {0}")]
    InvalidWorkflowType(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("unknown node-pool type: {0}")]
    UnknownNodePool(String),

    #[error("{0}")]
    Validation(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("workflow {0} is terminal")]
    WorkflowTerminal(String),

    #[error("step '{step}' cannot start before '{blocked_by}' has succeeded")]
    StepOutOfOrder { step: String, blocked_by: String },

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IdpError>;
