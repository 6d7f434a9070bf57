//! Provisioning strategies.
//!
//! Both strategies implement [`ProvisioningEngine`]; one is chosen from
//! `engine.mode` when the service is built and callers only ever see the
//! trait object.

mod delegated;
mod direct;

pub use delegated::DelegatedEngine;
pub use direct::DirectEngine;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use idp_core::config::{Config, EngineMode};
use idp_core::node_pool::NodePoolTable;
use idp_core::params::WorkflowParams;
use idp_core::workflow::Workflow;

use crate::cluster_api::ClusterApi;
use crate::error::Result;
use crate::journal::Journal;
use crate::sequencer::RunOutcome;

#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    fn mode(&self) -> EngineMode;

    /// Start work for a freshly accepted workflow.
    async fn launch(&self, workflow_id: &str, cancel: CancellationToken) -> Result<RunOutcome>;

    /// Continue a workflow that was just moved back to running by a retry.
    async fn relaunch(&self, workflow_id: &str, cancel: CancellationToken) -> Result<RunOutcome> {
        self.launch(workflow_id, cancel).await
    }

    /// Best-effort teardown of anything running outside this process.
    async fn abort(&self, workflow: &Workflow) -> Result<()>;
}

/// Shared inputs every strategy needs.
#[derive(Clone)]
pub struct EngineParts {
    pub config: Arc<Config>,
    pub pools: Arc<NodePoolTable>,
    pub api: Arc<dyn ClusterApi>,
    pub journal: Journal,
}

impl EngineParts {
    pub fn new(config: Arc<Config>, api: Arc<dyn ClusterApi>, journal: Journal) -> Self {
        let pools = Arc::new(config.node_pool_table());
        Self {
            config,
            pools,
            api,
            journal,
        }
    }

    pub(crate) fn params(&self, workflow: &Workflow) -> Result<WorkflowParams> {
        Ok(WorkflowParams::parse(
            workflow.workflow_type,
            &workflow.parameters,
            &self.pools,
        )?)
    }
}

pub fn build(parts: EngineParts) -> Arc<dyn ProvisioningEngine> {
    match parts.config.engine.mode {
        EngineMode::Direct => Arc::new(DirectEngine::new(parts)),
        EngineMode::Delegated => Arc::new(DelegatedEngine::new(parts)),
    }
}
