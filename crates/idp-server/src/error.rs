use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use idp_core::IdpError;
use idp_engine::EngineError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit 404 errors
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 404 through the `anyhow::Error` chain.
#[derive(Debug)]
struct NotFoundError(String);

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotFoundError {}

// ---------------------------------------------------------------------------
// AppError — unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 400 Bad Request error with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(IdpError::Validation(msg.into()).into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(NotFoundError(msg.into()).into())
    }
}

fn core_status(e: &IdpError) -> StatusCode {
    match e {
        IdpError::WorkflowNotFound(_) | IdpError::StepNotFound(_) => StatusCode::NOT_FOUND,
        IdpError::WorkflowExists(_)
        | IdpError::InvalidTransition { .. }
        | IdpError::WorkflowTerminal(_)
        | IdpError::StepOutOfOrder { .. } => StatusCode::CONFLICT,
        IdpError::InvalidWorkflowType(_)
        | IdpError::InvalidStatus(_)
        | IdpError::UnknownNodePool(_)
        | IdpError::Validation(_) => StatusCode::BAD_REQUEST,
        IdpError::Store(_) | IdpError::Io(_) | IdpError::Yaml(_) | IdpError::Json(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Core(inner) => core_status(inner),
        EngineError::ClusterApi(_) | EngineError::ResourceFailed { .. } => StatusCode::BAD_GATEWAY,
        EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Cancelled => StatusCode::CONFLICT,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(n) = self.0.downcast_ref::<NotFoundError>() {
            let body = serde_json::json!({ "error": n.0.clone() });
            return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
        }

        let status = if let Some(e) = self.0.downcast_ref::<EngineError>() {
            engine_status(e)
        } else if let Some(e) = self.0.downcast_ref::<IdpError>() {
            core_status(e)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
