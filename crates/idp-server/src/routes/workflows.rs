use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value};

use idp_core::log::LogEntry;
use idp_core::types::{WorkflowStatus, WorkflowType};
use idp_core::workflow::Workflow;
use idp_engine::ListFilter;

use crate::error::AppError;
use crate::state::AppState;

pub(crate) type Accepted = (StatusCode, Json<Workflow>);

/// Parameters must arrive as a JSON object.
pub(crate) fn object(body: Value) -> Result<Map<String, Value>, AppError> {
    match body {
        Value::Object(map) => Ok(map),
        other => Err(AppError::bad_request(format!(
            "request body must be a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Record and launch a workflow. The response is 202 even when validation
/// failed; the returned record then already carries status `failed`.
pub(crate) async fn accept(
    app: &AppState,
    workflow_type: WorkflowType,
    params: Map<String, Value>,
) -> Result<Accepted, AppError> {
    let service = app.service.clone();
    let workflow = tokio::task::spawn_blocking(move || service.start(workflow_type, params))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok((StatusCode::ACCEPTED, Json(workflow)))
}

fn summary(w: &Workflow) -> Value {
    let (done, total) = w.progress();
    serde_json::json!({
        "id": w.id,
        "name": w.name,
        "type": w.workflow_type,
        "status": w.status,
        "started_at": w.started_at,
        "ended_at": w.ended_at,
        "error": w.error,
        "dry_run": w.dry_run,
        "retry_count": w.retry_count,
        "remote_ref": w.remote_ref,
        "progress": { "done": done, "total": total },
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub workflow_type: Option<String>,
    pub status: Option<String>,
}

/// GET /api/workflows — newest first, optionally filtered.
pub async fn list_workflows(
    State(app): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = ListFilter {
        workflow_type: q
            .workflow_type
            .as_deref()
            .map(str::parse::<WorkflowType>)
            .transpose()?,
        status: q
            .status
            .as_deref()
            .map(str::parse::<WorkflowStatus>)
            .transpose()?,
    };
    let service = app.service.clone();
    let list = tokio::task::spawn_blocking(move || service.list(&filter))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    let mut list: Vec<&Workflow> = list.iter().collect();
    list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(Json(Value::Array(list.into_iter().map(summary).collect())))
}

/// GET /api/workflows/{id}
pub async fn get_workflow(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, AppError> {
    let service = app.service.clone();
    let workflow = tokio::task::spawn_blocking(move || service.get(&id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(workflow))
}

/// POST /api/workflows/{type}
pub async fn create_workflow(
    State(app): State<AppState>,
    Path(kind): Path<String>,
    Json(body): Json<Value>,
) -> Result<Accepted, AppError> {
    let workflow_type: WorkflowType = kind.parse()?;
    accept(&app, workflow_type, object(body)?).await
}

/// GET /api/workflows/{id}/logs
pub async fn get_logs(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LogEntry>>, AppError> {
    let service = app.service.clone();
    let logs = tokio::task::spawn_blocking(move || service.logs(&id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(logs))
}

#[derive(Debug, Default, Deserialize)]
pub struct AbortBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/workflows/{id}/abort — body `{ "reason": "..." }` is optional.
pub async fn abort_workflow(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Workflow>, AppError> {
    let reason = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<AbortBody>(&body)
            .map_err(|e| AppError::bad_request(format!("invalid abort request: {e}")))?
            .reason
    };
    let service = app.service.clone();
    let aborted = tokio::task::spawn_blocking(move || service.mark_aborted(&id, reason))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    app.service.teardown(&aborted).await;
    Ok(Json(aborted))
}

/// POST /api/workflows/{id}/retry
pub async fn retry_workflow(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Accepted, AppError> {
    let service = app.service.clone();
    let workflow = tokio::task::spawn_blocking(move || service.retry(&id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok((StatusCode::ACCEPTED, Json(workflow)))
}
