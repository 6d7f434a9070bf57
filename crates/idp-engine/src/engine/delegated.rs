use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use idp_core::config::EngineMode;
use idp_core::manifest::{self, ResourceRef};
use idp_core::workflow::{Workflow, VALIDATE_PARAMETERS};
use idp_core::IdpError;

use super::{EngineParts, ProvisioningEngine};
use crate::cluster_api::{Applied, Deleted};
use crate::error::Result;
use crate::sequencer::{RunOutcome, Sequencer, StepContext, StepOutcome, StepRunner};

/// Validates locally, then submits a remote workflow object that performs
/// the external steps. The mirror tracks it from there.
pub struct DelegatedEngine {
    parts: EngineParts,
    sequencer: Sequencer,
}

impl DelegatedEngine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            sequencer: Sequencer::new(parts.journal.clone()),
            parts,
        }
    }

    async fn submit(
        &self,
        workflow_id: &str,
        step_index: usize,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let journal = &self.parts.journal;
        let wf = journal.get(workflow_id)?;
        let params = self.parts.params(&wf)?;
        let m = manifest::remote_workflow(&self.parts.config, &self.parts.pools, &wf, &params)?;
        let template = self.parts.config.engine.template_for(wf.workflow_type);

        if wf.dry_run {
            journal.info(
                workflow_id,
                format!("[dry-run] would submit {} (template {template})", m.describe()),
            );
            journal.debug(
                workflow_id,
                format!(
                    "[dry-run] manifest for {}:\n{}",
                    m.describe(),
                    serde_json::to_string_pretty(&m.body)?
                ),
            );
            return self.sequencer.run(workflow_id, self, cancel).await;
        }

        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        match self.parts.api.create(&m).await {
            Ok(Applied::Created) => journal.info(
                workflow_id,
                format!("Submitted {} (template {template})", m.describe()),
            ),
            Ok(Applied::AlreadyExists) => {
                journal.warn(workflow_id, format!("{} already exists; continuing", m.describe()))
            }
            Err(e) => {
                let message = format!("failed to submit remote workflow {}: {e}", m.name);
                let written = journal.update(workflow_id, |w| {
                    w.fail_step(step_index, message.clone())?;
                    w.fail(message.clone())
                });
                return match written {
                    Ok(_) => {
                        journal.error(workflow_id, message.clone());
                        Ok(RunOutcome::Failed(message))
                    }
                    Err(IdpError::WorkflowTerminal(_)) => Ok(RunOutcome::Stopped),
                    Err(e) => Err(e.into()),
                };
            }
        }

        let recorded = journal.update(workflow_id, |w| {
            if w.is_terminal() {
                return Err(IdpError::WorkflowTerminal(w.id.clone()));
            }
            w.remote_ref = Some(m.name.clone());
            Ok(())
        });
        match recorded {
            Ok(_) => {
                info!(workflow = workflow_id, remote = %m.name, "handed off to remote engine");
                Ok(RunOutcome::HandedOff(step_index))
            }
            Err(IdpError::WorkflowTerminal(_)) => {
                // Aborted while the submit was in flight.
                if let Err(e) = self.parts.api.delete(&m.resource, &m.name).await {
                    warn!(workflow = workflow_id, remote = %m.name, error = %e, "failed to delete orphaned remote workflow");
                }
                Ok(RunOutcome::Stopped)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StepRunner for DelegatedEngine {
    async fn run_step(&self, step: &str, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        if step == VALIDATE_PARAMETERS {
            let params = self.parts.params(ctx.workflow)?;
            ctx.info(format!("Parameters validated for {}", params.target()));
            return Ok(StepOutcome::Done);
        }
        if !ctx.workflow.dry_run {
            return Err(IdpError::StepNotFound(format!("{step} runs in the remote workflow")).into());
        }
        ctx.info(format!("[dry-run] skip {step} (runs in remote workflow)"));
        Ok(StepOutcome::Skipped)
    }
}

#[async_trait]
impl ProvisioningEngine for DelegatedEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Delegated
    }

    async fn launch(&self, workflow_id: &str, cancel: CancellationToken) -> Result<RunOutcome> {
        match self.sequencer.run_local(workflow_id, self, &cancel).await? {
            RunOutcome::HandedOff(index) => self.submit(workflow_id, index, &cancel).await,
            other => Ok(other),
        }
    }

    async fn abort(&self, workflow: &Workflow) -> Result<()> {
        let Some(name) = &workflow.remote_ref else {
            return Ok(());
        };
        let resource = ResourceRef::remote_workflow(&self.parts.config);
        match self.parts.api.delete(&resource, name).await? {
            Deleted::Deleted => self
                .parts
                .journal
                .info(&workflow.id, format!("Deleted remote workflow {name}")),
            Deleted::NotFound => self
                .parts
                .journal
                .info(&workflow.id, format!("Remote workflow {name} already gone")),
        }
        Ok(())
    }
}
