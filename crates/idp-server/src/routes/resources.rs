//! Cluster and namespace convenience routes. Each one maps onto a workflow
//! type and goes through the same accept path as `POST /api/workflows/{type}`.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value};

use idp_core::types::WorkflowType;

use super::workflows::{accept, object, Accepted};
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    pub cluster_name: Option<String>,
    pub resource_group: Option<String>,
    pub dry_run: Option<bool>,
}

impl DeleteQuery {
    fn into_params(self, key: &str, name: String) -> Map<String, Value> {
        let mut params = Map::new();
        if let Some(cluster) = self.cluster_name {
            params.insert("clusterName".into(), Value::String(cluster));
        }
        if let Some(rg) = self.resource_group {
            params.insert("resourceGroup".into(), Value::String(rg));
        }
        if let Some(dry_run) = self.dry_run {
            params.insert("dryRun".into(), Value::Bool(dry_run));
        }
        // The path names the target.
        params.insert(key.to_string(), Value::String(name));
        params
    }
}

/// POST /api/clusters
pub async fn create_cluster(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Accepted, AppError> {
    accept(&app, WorkflowType::ClusterProvisioning, object(body)?).await
}

/// DELETE /api/clusters/{name}?resourceGroup=&dryRun=
pub async fn delete_cluster(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> Result<Accepted, AppError> {
    accept(
        &app,
        WorkflowType::ClusterDeletion,
        q.into_params("clusterName", name),
    )
    .await
}

/// POST /api/namespaces
pub async fn create_namespace(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Accepted, AppError> {
    accept(&app, WorkflowType::NamespaceProvisioning, object(body)?).await
}

/// PUT /api/namespaces/{name} — the path wins over any `namespace` in the body.
pub async fn update_namespace(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Accepted, AppError> {
    let mut params = object(body)?;
    params.insert("namespace".into(), Value::String(name));
    accept(&app, WorkflowType::NamespaceUpdate, params).await
}

/// DELETE /api/namespaces/{name}?clusterName=&dryRun=
pub async fn delete_namespace(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> Result<Accepted, AppError> {
    accept(
        &app,
        WorkflowType::NamespaceDeletion,
        q.into_params("namespace", name),
    )
    .await
}
