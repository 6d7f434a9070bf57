//! Submits manifests on behalf of step handlers.
//!
//! Every call honours the workflow's dry-run flag and the run's
//! cancellation token, and writes the progress lines operators read.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use idp_core::config::ReadinessConfig;
use idp_core::manifest::{Manifest, ResourceRef};

use crate::cluster_api::{Applied, ClusterApi, Deleted};
use crate::error::{EngineError, Result};
use crate::sequencer::{StepContext, StepOutcome};

const DRY_RUN: &str = "[dry-run]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending(String),
    Failed(String),
}

/// Readiness of a provisioned resource from its `status`: a `Ready=True`
/// condition or a `Succeeded` provisioning state.
pub fn readiness(obj: &Value) -> Readiness {
    let Some(status) = obj.get("status") else {
        return Readiness::Pending("no status yet".into());
    };

    let ready = status
        .get("conditions")
        .and_then(Value::as_array)
        .and_then(|c| {
            c.iter()
                .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
        });
    let ready_message = ready
        .and_then(|c| c.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);
    if ready.and_then(|c| c.get("status")).and_then(Value::as_str) == Some("True") {
        return Readiness::Ready;
    }

    match status.get("provisioningState").and_then(Value::as_str) {
        Some("Succeeded") => Readiness::Ready,
        Some("Failed") => Readiness::Failed(
            ready_message.unwrap_or_else(|| "provisioningState is Failed".into()),
        ),
        Some(state) => Readiness::Pending(state.to_string()),
        None => Readiness::Pending(ready_message.unwrap_or_else(|| "unknown".into())),
    }
}

fn pretty(body: &Value) -> String {
    serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string())
}

#[derive(Clone)]
pub struct Applier {
    api: Arc<dyn ClusterApi>,
}

impl Applier {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Create `manifest`. An existing object is a warning, not a failure.
    pub async fn create(&self, ctx: &StepContext<'_>, manifest: &Manifest) -> Result<StepOutcome> {
        let what = manifest.describe();
        if ctx.workflow.dry_run {
            ctx.info(format!("{DRY_RUN} would create {what}"));
            ctx.debug(format!("{DRY_RUN} manifest for {what}:\n{}", pretty(&manifest.body)));
            return Ok(StepOutcome::Skipped);
        }
        ctx.checkpoint()?;
        match self.api.create(manifest).await? {
            Applied::Created => ctx.info(format!("Created {what}")),
            Applied::AlreadyExists => ctx.warn(format!("{what} already exists; continuing")),
        }
        Ok(StepOutcome::Done)
    }

    /// Server-side apply `manifest`.
    pub async fn apply(&self, ctx: &StepContext<'_>, manifest: &Manifest) -> Result<StepOutcome> {
        let what = manifest.describe();
        if ctx.workflow.dry_run {
            ctx.info(format!("{DRY_RUN} would apply {what}"));
            ctx.debug(format!("{DRY_RUN} manifest for {what}:\n{}", pretty(&manifest.body)));
            return Ok(StepOutcome::Skipped);
        }
        ctx.checkpoint()?;
        self.api.apply(manifest).await?;
        ctx.info(format!("Applied {what}"));
        Ok(StepOutcome::Done)
    }

    /// Delete `name`. An absent object counts as deleted.
    pub async fn delete(
        &self,
        ctx: &StepContext<'_>,
        resource: &ResourceRef,
        name: &str,
    ) -> Result<StepOutcome> {
        let what = format!("{}: {name}", resource.kind);
        if ctx.workflow.dry_run {
            ctx.info(format!("{DRY_RUN} would delete {what}"));
            return Ok(StepOutcome::Skipped);
        }
        ctx.checkpoint()?;
        match self.api.delete(resource, name).await? {
            Deleted::Deleted => ctx.info(format!("Deleted {what}")),
            Deleted::NotFound => ctx.info(format!("{what} not found; nothing to delete")),
        }
        Ok(StepOutcome::Done)
    }

    /// Poll `name` until it reports ready, fails, or the timeout passes.
    pub async fn wait_ready(
        &self,
        ctx: &StepContext<'_>,
        resource: &ResourceRef,
        name: &str,
        cfg: &ReadinessConfig,
    ) -> Result<StepOutcome> {
        let what = format!("{}: {name}", resource.kind);
        if ctx.workflow.dry_run {
            ctx.info(format!("{DRY_RUN} skip waiting for {what}"));
            return Ok(StepOutcome::Skipped);
        }

        let deadline = Instant::now() + Duration::from_secs(cfg.timeout_secs);
        let interval = Duration::from_secs(cfg.check_interval_secs.max(1));
        let mut last_state = String::new();
        loop {
            ctx.checkpoint()?;
            match self.api.get(resource, name).await? {
                Some(obj) => match readiness(&obj) {
                    Readiness::Ready => {
                        ctx.info(format!("{what} is ready"));
                        return Ok(StepOutcome::Done);
                    }
                    Readiness::Failed(reason) => {
                        return Err(EngineError::ResourceFailed {
                            kind: resource.kind.clone(),
                            name: name.to_string(),
                            reason,
                        });
                    }
                    Readiness::Pending(state) => {
                        if state != last_state {
                            ctx.info(format!("Waiting for {what} (state: {state})"));
                            last_state = state;
                        }
                    }
                },
                None => ctx.debug(format!("{what} not visible yet")),
            }

            if Instant::now() >= deadline {
                return Err(EngineError::Timeout {
                    what,
                    secs: cfg.timeout_secs,
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ready_condition_wins() {
        let obj = json!({ "status": {
            "provisioningState": "Updating",
            "conditions": [{ "type": "Ready", "status": "True" }]
        }});
        assert_eq!(readiness(&obj), Readiness::Ready);
    }

    #[test]
    fn provisioning_state_succeeded_is_ready() {
        let obj = json!({ "status": { "provisioningState": "Succeeded" } });
        assert_eq!(readiness(&obj), Readiness::Ready);
    }

    #[test]
    fn failed_state_carries_condition_message() {
        let obj = json!({ "status": {
            "provisioningState": "Failed",
            "conditions": [{ "type": "Ready", "status": "False", "message": "quota exhausted" }]
        }});
        assert_eq!(readiness(&obj), Readiness::Failed("quota exhausted".into()));
    }

    #[test]
    fn missing_status_is_pending() {
        assert!(matches!(readiness(&json!({})), Readiness::Pending(_)));
        let obj = json!({ "status": { "provisioningState": "Creating" } });
        assert_eq!(readiness(&obj), Readiness::Pending("Creating".into()));
    }
}
