use idp_core::IdpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] IdpError),

    #[error("cluster API error: {0}")]
    ClusterApi(String),

    #[error("{kind} {name} failed: {reason}")]
    ResourceFailed {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("run cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Core(IdpError::Json(e))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
