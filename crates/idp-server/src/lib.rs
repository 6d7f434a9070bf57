pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use idp_engine::WorkflowService;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(service: Arc<WorkflowService>) -> Router {
    let app_state = state::AppState::new(service);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health::health))
        // Events
        .route("/api/events", get(routes::events::sse_events))
        .route("/api/ws", get(routes::events::ws_events))
        // Workflows
        .route("/api/workflows", get(routes::workflows::list_workflows))
        .route(
            "/api/workflows/{id}",
            get(routes::workflows::get_workflow).post(routes::workflows::create_workflow),
        )
        .route(
            "/api/workflows/{id}/logs",
            get(routes::workflows::get_logs),
        )
        .route(
            "/api/workflows/{id}/abort",
            post(routes::workflows::abort_workflow),
        )
        .route(
            "/api/workflows/{id}/retry",
            post(routes::workflows::retry_workflow),
        )
        // Clusters and namespaces
        .route("/api/clusters", post(routes::resources::create_cluster))
        .route(
            "/api/clusters/{name}",
            axum::routing::delete(routes::resources::delete_cluster),
        )
        .route(
            "/api/namespaces",
            post(routes::resources::create_namespace),
        )
        .route(
            "/api/namespaces/{name}",
            axum::routing::put(routes::resources::update_namespace)
                .delete(routes::resources::delete_namespace),
        )
        // Node pools
        .route(
            "/api/node-pools",
            get(routes::node_pools::list_node_pools),
        )
        .route(
            "/api/node-pools/{name}",
            get(routes::node_pools::get_node_pool),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the API on `port` until `shutdown` is cancelled.
pub async fn serve(
    service: Arc<WorkflowService>,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(service, listener, shutdown).await
}

/// Serve on a pre-bound listener, so callers can bind port 0 and read the
/// actual port first.
pub async fn serve_on(
    service: Arc<WorkflowService>,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(service);

    tracing::info!("IDP API listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
