use axum::extract::State;
use axum::Json;

use crate::state::AppState;

/// GET /api/health — liveness plus the active engine mode.
pub async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "engine": app.service.config().engine.mode.to_string(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
