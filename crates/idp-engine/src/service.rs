//! Front door for workflow requests.
//!
//! `WorkflowService` creates records, hands them to the configured engine,
//! and implements abort and retry. It is the only place that owns per-run
//! cancellation tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use idp_core::config::Config;
use idp_core::log::LogEntry;
use idp_core::manifest::ResourceRef;
use idp_core::node_pool::NodePoolTable;
use idp_core::params::{self, WorkflowParams};
use idp_core::store::WorkflowStore;
use idp_core::types::{WorkflowStatus, WorkflowType};
use idp_core::workflow::Workflow;
use idp_core::IdpError;

use crate::cluster_api::ClusterApi;
use crate::engine::{self, EngineParts, ProvisioningEngine};
use crate::error::{EngineError, Result};
use crate::journal::{Journal, WorkflowEvent};
use crate::mirror::Mirror;
use crate::sequencer::RunOutcome;

pub const DEFAULT_ABORT_REASON: &str = "aborted by user";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub workflow_type: Option<WorkflowType>,
    pub status: Option<WorkflowStatus>,
}

impl ListFilter {
    fn matches(&self, w: &Workflow) -> bool {
        self.workflow_type.is_none_or(|t| t == w.workflow_type)
            && self.status.is_none_or(|s| s == w.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    First,
    Retry,
}

pub struct WorkflowService {
    config: Arc<Config>,
    pools: Arc<NodePoolTable>,
    api: Arc<dyn ClusterApi>,
    journal: Journal,
    engine: Arc<dyn ProvisioningEngine>,
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl WorkflowService {
    pub fn new(
        config: Config,
        store: Arc<dyn WorkflowStore>,
        api: Arc<dyn ClusterApi>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let journal = Journal::new(store);
        let parts = EngineParts::new(config.clone(), api.clone(), journal.clone());
        let pools = parts.pools.clone();
        let engine = engine::build(parts);
        info!(mode = %engine.mode(), "workflow service ready");
        Arc::new(Self {
            config,
            pools,
            api,
            journal,
            engine,
            runs: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node_pools(&self) -> &NodePoolTable {
        &self.pools
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.journal.subscribe()
    }

    /// A mirror sharing this service's store, API and event channel.
    pub fn mirror(&self) -> Mirror {
        Mirror::new(
            self.api.clone(),
            self.journal.clone(),
            ResourceRef::remote_workflow(&self.config),
            self.config.mirror.clone(),
        )
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create and record a workflow without running it.
    ///
    /// Invalid parameters produce a workflow that is already `failed`, with
    /// every step still pending.
    pub fn accept(&self, workflow_type: WorkflowType, parameters: Map<String, Value>) -> Result<Workflow> {
        let name = params::display_name(workflow_type, &parameters);
        let dry_run = params::dry_run(&parameters);
        let validation = WorkflowParams::parse(workflow_type, &parameters, &self.pools);
        let mut workflow = Workflow::new(workflow_type, name, parameters, dry_run);

        if let Err(e) = &validation {
            workflow.fail(e.to_string())?;
        }
        self.journal.insert(&workflow)?;

        match validation {
            Ok(_) => {
                let mode = if dry_run { " (dry-run)" } else { "" };
                self.journal.info(
                    &workflow.id,
                    format!("Workflow {} accepted{mode}", workflow.name),
                );
                self.runs()
                    .insert(workflow.id.clone(), CancellationToken::new());
            }
            Err(e) => {
                self.journal
                    .error(&workflow.id, format!("Validation failed: {e}"));
                info!(workflow = %workflow.id, error = %e, "rejected workflow parameters");
            }
        }
        Ok(workflow)
    }

    /// Accept a workflow and run it in the background.
    pub fn start(
        self: &Arc<Self>,
        workflow_type: WorkflowType,
        parameters: Map<String, Value>,
    ) -> Result<Workflow> {
        let workflow = self.accept(workflow_type, parameters)?;
        if workflow.status == WorkflowStatus::Running {
            self.spawn(&workflow.id, Launch::First);
        }
        Ok(workflow)
    }

    fn spawn(self: &Arc<Self>, id: &str, launch: Launch) {
        let svc = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            svc.execute(&id, launch).await;
        });
    }

    /// Drive the engine for `id` and report the outcome. Never fails; errors
    /// are written to the workflow.
    pub async fn execute(&self, id: &str, launch: Launch) -> RunOutcome {
        let token = self.runs().get(id).cloned().unwrap_or_default();
        let result = match launch {
            Launch::First => self.engine.launch(id, token).await,
            Launch::Retry => self.engine.relaunch(id, token).await,
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => self.fail_unexpected(id, e),
        };
        // After a hand-off the mirror owns the workflow; the token is no
        // longer consulted.
        self.runs().remove(id);
        outcome
    }

    fn fail_unexpected(&self, id: &str, e: EngineError) -> RunOutcome {
        let message = e.to_string();
        error!(workflow = id, error = %message, "engine error");
        match self.journal.update(id, |w| w.fail(message.clone())) {
            Ok(_) => {
                self.journal.error(id, message.clone());
                RunOutcome::Failed(message)
            }
            Err(_) => RunOutcome::Stopped,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<Workflow> {
        Ok(self.journal.get(id)?)
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Workflow>> {
        Ok(self
            .journal
            .store()
            .list()?
            .into_iter()
            .filter(|w| filter.matches(w))
            .collect())
    }

    pub fn logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        Ok(self.journal.store().logs(id)?)
    }

    // -----------------------------------------------------------------------
    // Abort / retry
    // -----------------------------------------------------------------------

    /// Stop a running workflow. The local record ends `aborted` even if
    /// tearing down the remote object fails.
    pub async fn abort(&self, id: &str, reason: Option<String>) -> Result<Workflow> {
        let aborted = self.mark_aborted(id, reason)?;
        self.teardown(&aborted).await;
        Ok(aborted)
    }

    /// The synchronous half of [`abort`](Self::abort): cancel the local run
    /// and write `aborted`.
    ///
    /// The record goes terminal before any teardown, so a submit still in
    /// flight finds it terminal and removes its own object.
    pub fn mark_aborted(&self, id: &str, reason: Option<String>) -> Result<Workflow> {
        let workflow = self.journal.get(id)?;
        if workflow.status != WorkflowStatus::Running {
            return Err(IdpError::InvalidTransition {
                from: workflow.status.to_string(),
                to: WorkflowStatus::Aborted.to_string(),
                reason: "only running workflows can be aborted".into(),
            }
            .into());
        }
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string());

        if let Some(token) = self.runs().remove(id) {
            token.cancel();
        }
        Ok(self.journal.update(id, |w| w.abort(reason.clone()))?)
    }

    /// Ask the engine to delete remote execution for an aborted workflow.
    /// Failures are logged, never returned.
    pub async fn teardown(&self, aborted: &Workflow) {
        let id = aborted.id.as_str();
        if let Err(e) = self.engine.abort(aborted).await {
            warn!(workflow = id, error = %e, "remote teardown failed during abort");
            self.journal
                .warn(id, format!("Failed to delete remote workflow: {e}"));
        }
        let reason = aborted.abort_reason.as_deref().unwrap_or(DEFAULT_ABORT_REASON);
        self.journal.warn(id, format!("Workflow aborted: {reason}"));
        info!(workflow = id, reason = %reason, "workflow aborted");
    }

    /// Move a failed workflow back to running without starting it.
    pub fn prepare_retry(&self, id: &str) -> Result<Workflow> {
        let workflow = self.journal.update(id, |w| {
            w.retry()?;
            w.remote_ref = None;
            Ok(())
        })?;
        self.journal.info(
            id,
            format!("Retry #{} requested", workflow.retry_count),
        );
        self.runs().insert(id.to_string(), CancellationToken::new());
        Ok(workflow)
    }

    /// Retry a failed workflow in the background.
    pub fn retry(self: &Arc<Self>, id: &str) -> Result<Workflow> {
        let workflow = self.prepare_retry(id)?;
        self.spawn(id, Launch::Retry);
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use idp_core::config::EngineMode;
    use idp_core::log::DEFAULT_LOG_CAPACITY;
    use idp_core::store::MemoryStore;
    use idp_core::types::{LogLevel, StepEffect, StepStatus};
    use idp_core::workflow::catalogue;
    use serde_json::json;

    use crate::testing::{Call, FakeClusterApi};

    fn service_with(config: Config) -> (Arc<WorkflowService>, Arc<FakeClusterApi>) {
        let api = Arc::new(FakeClusterApi::new());
        let store = Arc::new(MemoryStore::new(DEFAULT_LOG_CAPACITY));
        (WorkflowService::new(config, store, api.clone()), api)
    }

    fn service(mode: EngineMode) -> (Arc<WorkflowService>, Arc<FakeClusterApi>) {
        let mut config = Config::default();
        config.engine.mode = mode;
        config.readiness.check_interval_secs = 1;
        service_with(config)
    }

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn demo_cluster(dry_run: bool) -> Map<String, Value> {
        params(json!({
            "clusterName": "demo",
            "location": "eastus",
            "nodePoolType": "standard",
            "dryRun": dry_run
        }))
    }

    fn valid_params(t: WorkflowType) -> Map<String, Value> {
        match t {
            WorkflowType::ClusterProvisioning => demo_cluster(true),
            WorkflowType::ClusterDeletion => params(json!({ "clusterName": "demo", "dryRun": true })),
            _ => params(json!({ "namespace": "team-a", "clusterName": "demo", "dryRun": true })),
        }
    }

    fn messages(svc: &WorkflowService, id: &str) -> Vec<String> {
        svc.logs(id).unwrap().into_iter().map(|e| e.message).collect()
    }

    // -----------------------------------------------------------------------
    // Direct engine
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn dry_run_cluster_succeeds_without_touching_the_cluster() {
        let (svc, api) = service(EngineMode::Direct);
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(true))
            .unwrap();
        assert!(wf.dry_run);
        assert_eq!(wf.name, "cluster-provisioning: demo");

        assert_eq!(svc.execute(&wf.id, Launch::First).await, RunOutcome::Succeeded);

        let done = svc.get(&wf.id).unwrap();
        assert_eq!(done.status, WorkflowStatus::Succeeded);
        assert!(done.ended_at.is_some());
        assert!(done.steps.iter().all(|s| s.status == StepStatus::Succeeded));
        assert!(!done.steps[0].skipped);
        assert!(done.steps[1..].iter().all(|s| s.skipped));
        assert!(api.calls().is_empty());

        let logs = messages(&svc, &wf.id);
        assert!(logs.iter().any(|m| m.contains("rg-demo")), "{logs:?}");
        assert!(logs.iter().any(|m| m.contains("ManagedCluster: demo")), "{logs:?}");
        assert_eq!(logs.last().unwrap(), "Workflow completed successfully");
    }

    #[tokio::test]
    async fn dry_run_logs_every_external_step() {
        for t in WorkflowType::all() {
            let (svc, api) = service(EngineMode::Direct);
            let wf = svc.accept(*t, valid_params(*t)).unwrap();
            assert_eq!(svc.execute(&wf.id, Launch::First).await, RunOutcome::Succeeded, "{t}");
            assert!(api.writes().is_empty(), "{t}");

            let logs = messages(&svc, &wf.id);
            for spec in catalogue(*t).iter().filter(|s| s.effect == StepEffect::External) {
                let start = logs
                    .iter()
                    .position(|m| *m == format!("Starting step: {}", spec.name))
                    .unwrap_or_else(|| panic!("{t}: {} never started", spec.name));
                let end = logs
                    .iter()
                    .position(|m| *m == format!("Step {} skipped", spec.name))
                    .unwrap_or_else(|| panic!("{t}: {} not skipped", spec.name));
                assert!(
                    logs[start..end].iter().any(|m| m.starts_with("[dry-run]")),
                    "{t}: {} has no dry-run line in {logs:?}",
                    spec.name
                );
            }
        }
    }

    #[tokio::test]
    async fn steps_run_in_canonical_order() {
        let (svc, _) = service(EngineMode::Direct);
        let wf = svc
            .accept(WorkflowType::NamespaceProvisioning, valid_params(WorkflowType::NamespaceProvisioning))
            .unwrap();
        svc.execute(&wf.id, Launch::First).await;

        let started: Vec<String> = messages(&svc, &wf.id)
            .into_iter()
            .filter_map(|m| m.strip_prefix("Starting step: ").map(str::to_string))
            .collect();
        assert_eq!(
            started,
            vec![
                "validate-parameters",
                "create-namespace",
                "apply-resource-quota",
                "apply-network-policy",
            ]
        );

        let done = svc.get(&wf.id).unwrap();
        for pair in done.steps.windows(2) {
            assert!(pair[0].ended_at <= pair[1].started_at);
        }
    }

    #[tokio::test]
    async fn missing_parameters_fail_before_any_step() {
        let (svc, api) = service(EngineMode::Direct);
        let wf = svc
            .accept(
                WorkflowType::ClusterProvisioning,
                params(json!({ "location": "eastus", "nodePoolType": "standard" })),
            )
            .unwrap();

        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert!(wf.ended_at.is_some());
        let error = wf.error.as_deref().unwrap();
        assert!(error.contains("missing required parameters"), "{error}");
        assert!(error.contains("clusterName"), "{error}");
        assert!(wf.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(wf.name, "cluster-provisioning: unnamed");

        let logs = svc.logs(&wf.id).unwrap();
        assert_eq!(logs[0].level, LogLevel::Error);
        assert!(logs[0].message.starts_with("Validation failed:"));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn cluster_provisioning_creates_resources_in_order() {
        let (svc, api) = service(EngineMode::Direct);
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();
        assert_eq!(svc.execute(&wf.id, Launch::First).await, RunOutcome::Succeeded);

        let calls = api.calls();
        assert_eq!(
            calls,
            vec![
                Call::Create { kind: "ResourceGroup".into(), name: "rg-demo".into() },
                Call::Create { kind: "ManagedCluster".into(), name: "demo".into() },
                Call::Get { kind: "ManagedCluster".into(), name: "demo".into() },
            ]
        );
        let done = svc.get(&wf.id).unwrap();
        // No GitOps repository configured.
        assert!(done.steps[4].skipped);
        assert!(!done.steps[1].skipped);
    }

    #[tokio::test]
    async fn existing_resource_is_a_warning_not_a_failure() {
        let (svc, api) = service(EngineMode::Direct);
        api.put(
            "ResourceGroup",
            "rg-demo",
            json!({ "status": { "provisioningState": "Succeeded" } }),
        );
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();
        assert_eq!(svc.execute(&wf.id, Launch::First).await, RunOutcome::Succeeded);

        let done = svc.get(&wf.id).unwrap();
        assert_eq!(done.steps[1].status, StepStatus::Succeeded);
        assert_eq!(done.steps[2].status, StepStatus::Succeeded);

        let logs = svc.logs(&wf.id).unwrap();
        let warning = logs
            .iter()
            .find(|e| e.level == LogLevel::Warn)
            .expect("warning logged");
        assert_eq!(warning.message, "ResourceGroup: rg-demo already exists; continuing");
    }

    #[tokio::test]
    async fn failed_create_fails_step_and_workflow() {
        let (svc, api) = service(EngineMode::Direct);
        api.fail_create("ManagedCluster", "quota exceeded");
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();

        let outcome = svc.execute(&wf.id, Launch::First).await;
        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.contains("quota exceeded")));

        let done = svc.get(&wf.id).unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.steps[1].status, StepStatus::Succeeded);
        assert_eq!(done.steps[2].status, StepStatus::Failed);
        assert!(done.steps[3..].iter().all(|s| s.status == StepStatus::Pending));
        assert!(messages(&svc, &wf.id)
            .iter()
            .any(|m| m.starts_with("Step create-managed-cluster failed:")));
    }

    #[tokio::test]
    async fn failed_provisioning_state_fails_the_wait() {
        let (svc, api) = service(EngineMode::Direct);
        api.put(
            "ManagedCluster",
            "demo",
            json!({ "status": { "provisioningState": "Failed" } }),
        );
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();

        let outcome = svc.execute(&wf.id, Launch::First).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed("ManagedCluster demo failed: provisioningState is Failed".into())
        );
        let done = svc.get(&wf.id).unwrap();
        assert_eq!(done.steps[3].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn readiness_timeout_fails_the_wait() {
        let mut config = Config::default();
        config.readiness.timeout_secs = 0;
        let (svc, api) = service_with(config);
        api.keep_pending("ManagedCluster");
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();

        let outcome = svc.execute(&wf.id, Launch::First).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed("timed out after 0s waiting for ManagedCluster: demo".into())
        );
    }

    #[tokio::test]
    async fn retry_resumes_from_the_failed_step() {
        let (svc, api) = service(EngineMode::Direct);
        api.fail_create("ManagedCluster", "quota exceeded");
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();
        svc.execute(&wf.id, Launch::First).await;

        api.heal();
        let retried = svc.prepare_retry(&wf.id).unwrap();
        assert_eq!(retried.id, wf.id);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.status, WorkflowStatus::Running);
        assert!(retried.ended_at.is_none());
        assert!(retried.error.is_none());
        assert_eq!(retried.steps[1].status, StepStatus::Succeeded);
        assert_eq!(retried.steps[2].status, StepStatus::Pending);

        assert_eq!(svc.execute(&wf.id, Launch::Retry).await, RunOutcome::Succeeded);
        let groups = api
            .calls()
            .into_iter()
            .filter(|c| c.kind() == "ResourceGroup")
            .count();
        assert_eq!(groups, 1, "resource group created once");
        assert!(messages(&svc, &wf.id).contains(&"Retry #1 requested".to_string()));
    }

    #[tokio::test]
    async fn retry_requires_a_failed_workflow() {
        let (svc, _) = service(EngineMode::Direct);
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(true))
            .unwrap();
        let err = svc.prepare_retry(&wf.id).unwrap_err();
        assert!(matches!(err, EngineError::Core(IdpError::InvalidTransition { .. })), "{err}");

        svc.execute(&wf.id, Launch::First).await;
        assert!(svc.prepare_retry(&wf.id).is_err(), "succeeded is final");
    }

    #[tokio::test]
    async fn abort_before_launch_stops_the_run() {
        let (svc, api) = service(EngineMode::Direct);
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();

        let aborted = svc.abort(&wf.id, None).await.unwrap();
        assert_eq!(aborted.status, WorkflowStatus::Aborted);
        assert_eq!(aborted.abort_reason.as_deref(), Some(DEFAULT_ABORT_REASON));

        assert_eq!(svc.execute(&wf.id, Launch::First).await, RunOutcome::Stopped);
        assert!(api.calls().is_empty());

        let err = svc.abort(&wf.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Core(IdpError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn abort_interrupts_a_readiness_wait() {
        let (svc, api) = service(EngineMode::Direct);
        api.keep_pending("ManagedCluster");
        let wf = svc
            .start(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();

        for _ in 0..200 {
            let current = svc.get(&wf.id).unwrap();
            if current.steps[3].status == StepStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.get(&wf.id).unwrap().steps[3].status, StepStatus::Running);

        let aborted = svc
            .abort(&wf.id, Some("no longer needed".into()))
            .await
            .unwrap();
        assert_eq!(aborted.status, WorkflowStatus::Aborted);
        assert_eq!(aborted.abort_reason.as_deref(), Some("no longer needed"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = svc.get(&wf.id).unwrap();
        assert_eq!(after.status, WorkflowStatus::Aborted);
        assert_eq!(after.steps[4].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn list_filters_by_type_and_status() {
        let (svc, _) = service(EngineMode::Direct);
        let ok = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(true))
            .unwrap();
        svc.accept(WorkflowType::ClusterProvisioning, Map::new()).unwrap();
        svc.accept(WorkflowType::NamespaceDeletion, valid_params(WorkflowType::NamespaceDeletion))
            .unwrap();

        assert_eq!(svc.list(&ListFilter::default()).unwrap().len(), 3);
        let clusters = ListFilter {
            workflow_type: Some(WorkflowType::ClusterProvisioning),
            status: None,
        };
        assert_eq!(svc.list(&clusters).unwrap().len(), 2);
        let running = ListFilter {
            workflow_type: Some(WorkflowType::ClusterProvisioning),
            status: Some(WorkflowStatus::Running),
        };
        let found = svc.list(&running).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ok.id);
    }

    // -----------------------------------------------------------------------
    // Delegated engine
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn delegated_run_submits_remote_workflow() {
        let (svc, api) = service(EngineMode::Delegated);
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();

        assert_eq!(svc.execute(&wf.id, Launch::First).await, RunOutcome::HandedOff(1));

        let current = svc.get(&wf.id).unwrap();
        assert_eq!(current.status, WorkflowStatus::Running);
        assert_eq!(current.steps[0].status, StepStatus::Succeeded);
        assert_eq!(current.steps[1].status, StepStatus::Pending);
        let remote = current.remote_ref.clone().unwrap();
        assert!(remote.starts_with("cp-demo-"), "{remote}");

        let submitted = api.object("Workflow", &remote).unwrap();
        assert_eq!(
            submitted["spec"]["workflowTemplateRef"]["name"],
            "cluster-provisioning-template"
        );
        assert_eq!(api.writes().len(), 1);
    }

    #[tokio::test]
    async fn delegated_dry_run_submits_nothing() {
        let (svc, api) = service(EngineMode::Delegated);
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(true))
            .unwrap();

        assert_eq!(svc.execute(&wf.id, Launch::First).await, RunOutcome::Succeeded);
        let done = svc.get(&wf.id).unwrap();
        assert!(done.remote_ref.is_none());
        assert!(done.steps[1..].iter().all(|s| s.skipped));
        assert!(api.calls().is_empty());
        assert!(messages(&svc, &wf.id)
            .iter()
            .any(|m| m.starts_with("[dry-run] would submit Workflow: cp-demo-")));
    }

    #[tokio::test]
    async fn failed_submit_fails_the_first_remote_step() {
        let (svc, api) = service(EngineMode::Delegated);
        api.fail_create("Workflow", "admission denied");
        let wf = svc
            .accept(WorkflowType::NamespaceDeletion, params(json!({ "namespace": "team-a", "clusterName": "demo" })))
            .unwrap();

        let outcome = svc.execute(&wf.id, Launch::First).await;
        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.starts_with("failed to submit remote workflow nd-team-a-")));
        let done = svc.get(&wf.id).unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.steps[1].status, StepStatus::Failed);
        assert!(done.remote_ref.is_none());
    }

    #[tokio::test]
    async fn abort_keeps_local_record_when_remote_delete_fails() {
        let (svc, api) = service(EngineMode::Delegated);
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();
        svc.execute(&wf.id, Launch::First).await;
        api.fail_delete("forbidden");

        let aborted = svc
            .abort(&wf.id, Some("wrong region".into()))
            .await
            .unwrap();
        assert_eq!(aborted.status, WorkflowStatus::Aborted);
        assert_eq!(aborted.abort_reason.as_deref(), Some("wrong region"));
        assert!(aborted.ended_at.is_some());

        let logs = svc.logs(&wf.id).unwrap();
        assert!(logs.iter().any(|e| e.level == LogLevel::Warn
            && e.message == "Failed to delete remote workflow: cluster API error: forbidden"));
        assert!(logs
            .iter()
            .any(|e| e.message == "Workflow aborted: wrong region"));
    }

    #[tokio::test]
    async fn abort_deletes_the_remote_workflow() {
        let (svc, api) = service(EngineMode::Delegated);
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();
        svc.execute(&wf.id, Launch::First).await;
        let remote = svc.get(&wf.id).unwrap().remote_ref.unwrap();

        svc.abort(&wf.id, None).await.unwrap();
        assert!(api.object("Workflow", &remote).is_none());
        assert!(messages(&svc, &wf.id).contains(&format!("Deleted remote workflow {remote}")));
    }

    #[tokio::test]
    async fn abort_during_submit_removes_the_submitted_workflow() {
        let (svc, api) = service(EngineMode::Delegated);
        let gate = api.hold_creates();
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();
        let run = {
            let svc = svc.clone();
            let id = wf.id.clone();
            tokio::spawn(async move { svc.execute(&id, Launch::First).await })
        };
        api.create_reached().await;

        let aborted = svc.abort(&wf.id, None).await.unwrap();
        assert_eq!(aborted.status, WorkflowStatus::Aborted);
        assert!(aborted.remote_ref.is_none());

        gate.notify_one();
        assert_eq!(run.await.unwrap(), RunOutcome::Stopped);

        let submitted = api
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Create { kind, name } if kind == "Workflow" => Some(name),
                _ => None,
            })
            .expect("remote workflow submitted");
        assert!(api.object("Workflow", &submitted).is_none(), "{submitted} left running");
        assert!(api.calls().contains(&Call::Delete {
            kind: "Workflow".into(),
            name: submitted,
        }));
        let done = svc.get(&wf.id).unwrap();
        assert_eq!(done.status, WorkflowStatus::Aborted);
        assert!(done.remote_ref.is_none());
    }

    // -----------------------------------------------------------------------
    // Mirror
    // -----------------------------------------------------------------------

    fn remote_status(version: &str, phase: &str, finished: Option<&str>, message: Option<&str>) -> Value {
        json!({
            "metadata": { "resourceVersion": version },
            "status": {
                "phase": phase,
                "startedAt": "2024-05-01T10:00:00Z",
                "finishedAt": finished,
                "message": message,
                "nodes": {
                    "n1": {
                        "displayName": "create-resource-group",
                        "phase": "Succeeded",
                        "startedAt": "2024-05-01T10:00:01Z",
                        "finishedAt": "2024-05-01T10:01:00Z"
                    },
                    "n2": {
                        "displayName": "create-managed-cluster",
                        "phase": phase,
                        "startedAt": "2024-05-01T10:01:01Z",
                        "finishedAt": finished,
                        "message": message
                    }
                }
            }
        })
    }

    async fn handed_off(svc: &Arc<WorkflowService>) -> (String, String) {
        let wf = svc
            .accept(WorkflowType::ClusterProvisioning, demo_cluster(false))
            .unwrap();
        svc.execute(&wf.id, Launch::First).await;
        let remote = svc.get(&wf.id).unwrap().remote_ref.unwrap();
        (wf.id, remote)
    }

    #[tokio::test]
    async fn mirror_follows_remote_to_success() {
        let (svc, api) = service(EngineMode::Delegated);
        let (id, remote) = handed_off(&svc).await;
        let mirror = svc.mirror();

        api.put("Workflow", &remote, remote_status("1", "Running", None, None));
        let report = mirror.tick().await.unwrap();
        assert_eq!(report.updated, 1);
        let running = svc.get(&id).unwrap();
        assert_eq!(running.status, WorkflowStatus::Running);
        assert_eq!(running.steps[1].status, StepStatus::Succeeded);
        assert_eq!(running.steps[2].status, StepStatus::Running);

        let finished = "2024-05-01T10:20:00Z";
        api.put("Workflow", &remote, remote_status("2", "Succeeded", Some(finished), None));
        mirror.tick().await.unwrap();
        let done = svc.get(&id).unwrap();
        assert_eq!(done.status, WorkflowStatus::Succeeded);
        assert_eq!(done.ended_at.unwrap().to_rfc3339(), "2024-05-01T10:20:00+00:00");
        assert!(messages(&svc, &id).contains(&format!("Remote workflow {remote} succeeded")));

        // Terminal workflows are no longer polled.
        assert_eq!(mirror.tick().await.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn mirror_records_remote_failure() {
        let (svc, api) = service(EngineMode::Delegated);
        let (id, remote) = handed_off(&svc).await;

        api.put(
            "Workflow",
            &remote,
            remote_status("3", "Failed", Some("2024-05-01T10:05:00Z"), Some("quota exceeded")),
        );
        svc.mirror().tick().await.unwrap();

        let done = svc.get(&id).unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("quota exceeded"));
        assert_eq!(done.steps[2].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn unchanged_resource_version_is_not_rewritten() {
        let (svc, api) = service(EngineMode::Delegated);
        let (_, remote) = handed_off(&svc).await;
        let mirror = svc.mirror();

        api.put("Workflow", &remote, remote_status("7", "Running", None, None));
        assert_eq!(mirror.tick().await.unwrap().updated, 1);

        let mut events = svc.subscribe();
        let report = mirror.tick().await.unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.unchanged, 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn mirror_backs_off_after_fetch_errors() {
        let (svc, api) = service(EngineMode::Delegated);
        let (id, _) = handed_off(&svc).await;
        let mirror = svc.mirror();

        api.fail_gets(1);
        let report = mirror.tick().await.unwrap();
        assert_eq!(report.errors, 1);

        let report = mirror.tick().await.unwrap();
        assert_eq!(report.fetched, 0, "still backing off");
        assert_eq!(svc.get(&id).unwrap().status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn vanished_remote_workflow_fails_after_threshold() {
        let (svc, api) = service(EngineMode::Delegated);
        let (id, remote) = handed_off(&svc).await;
        let mirror = svc.mirror();
        api.remove("Workflow", &remote);

        for _ in 0..2 {
            assert_eq!(mirror.tick().await.unwrap().missing, 1);
            assert_eq!(svc.get(&id).unwrap().status, WorkflowStatus::Running);
        }
        mirror.tick().await.unwrap();
        let done = svc.get(&id).unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.error, Some(format!("remote workflow {remote} not found")));
    }

    #[tokio::test]
    async fn retry_after_remote_failure_resubmits_under_new_name() {
        let (svc, api) = service(EngineMode::Delegated);
        let (id, remote) = handed_off(&svc).await;
        api.put(
            "Workflow",
            &remote,
            remote_status("3", "Failed", Some("2024-05-01T10:05:00Z"), Some("quota exceeded")),
        );
        svc.mirror().tick().await.unwrap();

        svc.prepare_retry(&id).unwrap();
        assert_eq!(svc.execute(&id, Launch::Retry).await, RunOutcome::HandedOff(2));

        let current = svc.get(&id).unwrap();
        assert_eq!(current.retry_count, 1);
        assert_eq!(current.remote_ref, Some(format!("{remote}-r1")));
        assert!(api.object("Workflow", &format!("{remote}-r1")).is_some());
    }
}
