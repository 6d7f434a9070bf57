use std::sync::Arc;

use idp_engine::WorkflowService;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<WorkflowService>,
}

impl AppState {
    pub fn new(service: Arc<WorkflowService>) -> Self {
        Self { service }
    }
}
