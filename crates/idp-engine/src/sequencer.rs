//! Runs a workflow's steps strictly in order.
//!
//! The sequencer owns every step and workflow status change on the local
//! execution path. Handlers only do the work and report an outcome; they
//! never touch the record themselves.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use idp_core::types::StepEffect;
use idp_core::workflow::{catalogue, Workflow};
use idp_core::IdpError;

use crate::error::{EngineError, Result};
use crate::journal::Journal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// The step had nothing to do (dry-run, or not configured).
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
    /// The token was cancelled; nothing further was written.
    Cancelled,
    /// The workflow went terminal underneath the run (e.g. aborted).
    Stopped,
    /// Local steps are done; the first external step is at this index.
    HandedOff(usize),
}

/// What a handler sees while running one step.
pub struct StepContext<'a> {
    pub workflow: &'a Workflow,
    pub journal: &'a Journal,
    pub cancel: &'a CancellationToken,
}

impl StepContext<'_> {
    pub fn id(&self) -> &str {
        &self.workflow.id
    }

    /// Call before every external request.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    pub fn info(&self, message: impl Into<String>) {
        self.journal.info(self.id(), message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.journal.warn(self.id(), message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.journal.debug(self.id(), message);
    }
}

#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(&self, step: &str, ctx: &StepContext<'_>) -> Result<StepOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    Done,
    FirstExternal,
}

#[derive(Clone)]
pub struct Sequencer {
    journal: Journal,
}

impl Sequencer {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }

    /// Run every remaining step. Resumes from the first step that has not
    /// succeeded, so the same call serves first runs and retries.
    pub async fn run(
        &self,
        id: &str,
        runner: &dyn StepRunner,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.drive(id, runner, cancel, Until::Done).await
    }

    /// Run steps until the next one is external, then hand off.
    pub async fn run_local(
        &self,
        id: &str,
        runner: &dyn StepRunner,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.drive(id, runner, cancel, Until::FirstExternal).await
    }

    async fn drive(
        &self,
        id: &str,
        runner: &dyn StepRunner,
        cancel: &CancellationToken,
        until: Until,
    ) -> Result<RunOutcome> {
        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            let workflow = self.journal.get(id)?;
            if workflow.is_terminal() {
                return Ok(RunOutcome::Stopped);
            }

            let Some(index) = workflow.next_pending_step() else {
                return self.complete(id);
            };
            let name = workflow.steps[index].name.clone();

            if until == Until::FirstExternal {
                let external = catalogue(workflow.workflow_type)
                    .iter()
                    .any(|s| s.name == name && s.effect == StepEffect::External);
                if external {
                    return Ok(RunOutcome::HandedOff(index));
                }
            }

            let workflow = match self.journal.update(id, |w| w.start_step(index)) {
                Ok(w) => w,
                Err(IdpError::WorkflowTerminal(_)) => return Ok(RunOutcome::Stopped),
                Err(e) => return Err(e.into()),
            };
            self.journal.info(id, format!("Starting step: {name}"));
            debug!(workflow = id, step = %name, "step started");

            let ctx = StepContext {
                workflow: &workflow,
                journal: &self.journal,
                cancel,
            };
            let result = runner.run_step(&name, &ctx).await;

            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            match result {
                Ok(outcome) => {
                    let skipped = outcome == StepOutcome::Skipped;
                    match self.journal.update(id, |w| w.succeed_step(index, skipped)) {
                        Ok(_) => {}
                        Err(IdpError::WorkflowTerminal(_)) => return Ok(RunOutcome::Stopped),
                        Err(e) => return Err(e.into()),
                    }
                    let msg = if skipped {
                        format!("Step {name} skipped")
                    } else {
                        format!("Step {name} completed")
                    };
                    self.journal.info(id, msg);
                }
                Err(EngineError::Cancelled) => return Ok(RunOutcome::Cancelled),
                Err(e) => {
                    let message = e.to_string();
                    let written = self.journal.update(id, |w| {
                        w.fail_step(index, message.clone())?;
                        w.fail(message.clone())
                    });
                    match written {
                        Ok(_) => {}
                        Err(IdpError::WorkflowTerminal(_)) => return Ok(RunOutcome::Stopped),
                        Err(e) => return Err(e.into()),
                    }
                    self.journal
                        .error(id, format!("Step {name} failed: {message}"));
                    info!(workflow = id, step = %name, error = %message, "workflow failed");
                    return Ok(RunOutcome::Failed(message));
                }
            }
        }
    }

    fn complete(&self, id: &str) -> Result<RunOutcome> {
        match self.journal.update(id, |w| w.succeed()) {
            Ok(_) => {}
            Err(IdpError::InvalidTransition { .. }) => return Ok(RunOutcome::Stopped),
            Err(e) => return Err(e.into()),
        }
        self.journal.info(id, "Workflow completed successfully");
        info!(workflow = id, "workflow succeeded");
        Ok(RunOutcome::Succeeded)
    }
}
