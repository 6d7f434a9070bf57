use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use idp_core::config::EngineMode;
use idp_core::manifest::{self, ResourceRef};
use idp_core::params::WorkflowParams;
use idp_core::types::WorkflowType;
use idp_core::workflow::{
    Workflow, APPLY_NETWORK_POLICY, APPLY_RESOURCE_QUOTA, CLEANUP_RECORDS, CONFIGURE_GITOPS,
    CREATE_MANAGED_CLUSTER, CREATE_NAMESPACE, CREATE_RESOURCE_GROUP, DELETE_MANAGED_CLUSTER,
    DELETE_NAMESPACE, DELETE_RESOURCE_GROUP, UPDATE_NAMESPACE, VALIDATE_PARAMETERS,
    WAIT_FOR_CLUSTER_READY,
};
use idp_core::IdpError;

use super::{EngineParts, ProvisioningEngine};
use crate::applier::Applier;
use crate::error::Result;
use crate::sequencer::{RunOutcome, Sequencer, StepContext, StepOutcome, StepRunner};

/// Runs every step in-process, submitting resources one by one.
pub struct DirectEngine {
    parts: EngineParts,
    applier: Applier,
    sequencer: Sequencer,
}

impl DirectEngine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            applier: Applier::new(parts.api.clone()),
            sequencer: Sequencer::new(parts.journal.clone()),
            parts,
        }
    }

    async fn configure_gitops(
        &self,
        ctx: &StepContext<'_>,
        p: &idp_core::params::ClusterParams,
    ) -> Result<StepOutcome> {
        let Some(manifests) = manifest::gitops(&self.parts.config, p, ctx.id()) else {
            let prefix = if ctx.workflow.dry_run { "[dry-run] " } else { "" };
            ctx.info(format!(
                "{prefix}skip {CONFIGURE_GITOPS}: no GitOps repository configured"
            ));
            return Ok(StepOutcome::Skipped);
        };
        let mut outcome = StepOutcome::Done;
        for m in &manifests {
            outcome = self.applier.create(ctx, m).await?;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl StepRunner for DirectEngine {
    async fn run_step(&self, step: &str, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let cfg = &self.parts.config;
        let pools = &self.parts.pools;
        let params = self.parts.params(ctx.workflow)?;
        let id = ctx.id();

        match (step, &params) {
            (VALIDATE_PARAMETERS, _) => {
                ctx.info(format!("Parameters validated for {}", params.target()));
                Ok(StepOutcome::Done)
            }

            (CREATE_RESOURCE_GROUP, WorkflowParams::Cluster(p)) => {
                let m = manifest::resource_group(cfg, pools, p, id)?;
                self.applier.create(ctx, &m).await
            }
            (CREATE_MANAGED_CLUSTER, WorkflowParams::Cluster(p)) => {
                let m = manifest::managed_cluster(cfg, pools, p, id)?;
                self.applier.create(ctx, &m).await
            }
            (WAIT_FOR_CLUSTER_READY, WorkflowParams::Cluster(p)) => {
                self.applier
                    .wait_ready(
                        ctx,
                        &ResourceRef::managed_cluster(cfg),
                        &p.cluster_name,
                        &cfg.readiness,
                    )
                    .await
            }
            (CONFIGURE_GITOPS, WorkflowParams::Cluster(p)) => self.configure_gitops(ctx, p).await,

            (DELETE_MANAGED_CLUSTER, WorkflowParams::ClusterDeletion(p)) => {
                self.applier
                    .delete(ctx, &ResourceRef::managed_cluster(cfg), &p.cluster_name)
                    .await
            }
            (DELETE_RESOURCE_GROUP, WorkflowParams::ClusterDeletion(p)) => {
                self.applier
                    .delete(ctx, &ResourceRef::resource_group(cfg), &p.resource_group)
                    .await
            }

            (CREATE_NAMESPACE, WorkflowParams::Namespace(p)) => {
                self.applier.create(ctx, &manifest::namespace(p, id)?).await
            }
            (UPDATE_NAMESPACE, WorkflowParams::Namespace(p)) => {
                self.applier.apply(ctx, &manifest::namespace(p, id)?).await
            }
            (APPLY_RESOURCE_QUOTA, WorkflowParams::Namespace(p)) => {
                let m = manifest::resource_quota(p, id)?;
                if ctx.workflow.workflow_type == WorkflowType::NamespaceUpdate {
                    self.applier.apply(ctx, &m).await
                } else {
                    self.applier.create(ctx, &m).await
                }
            }
            (APPLY_NETWORK_POLICY, WorkflowParams::Namespace(p)) => {
                self.applier
                    .create(ctx, &manifest::network_policy(p, id)?)
                    .await
            }
            (DELETE_NAMESPACE, WorkflowParams::NamespaceDeletion(p)) => {
                self.applier
                    .delete(ctx, &ResourceRef::namespace(), &p.namespace)
                    .await
            }

            (CLEANUP_RECORDS, _) => {
                ctx.info(format!("Released tracking records for {}", params.target()));
                Ok(StepOutcome::Done)
            }

            _ => Err(IdpError::StepNotFound(format!(
                "{step} is not part of {}",
                ctx.workflow.workflow_type
            ))
            .into()),
        }
    }
}

#[async_trait]
impl ProvisioningEngine for DirectEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Direct
    }

    async fn launch(&self, workflow_id: &str, cancel: CancellationToken) -> Result<RunOutcome> {
        self.sequencer.run(workflow_id, self, &cancel).await
    }

    async fn abort(&self, _workflow: &Workflow) -> Result<()> {
        // Nothing runs outside the process; cancelling the token is enough.
        Ok(())
    }
}
