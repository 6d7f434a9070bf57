use axum::extract::{Path, State};
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/node-pools — the merged node-pool table.
pub async fn list_node_pools(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(serde_json::to_value(app.service.node_pools())?))
}

/// GET /api/node-pools/{name}
pub async fn get_node_pool(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pool = app
        .service
        .node_pools()
        .get(&name)
        .ok_or_else(|| AppError::not_found(format!("unknown node-pool type: {name}")))?;
    Ok(Json(serde_json::to_value(pool)?))
}
