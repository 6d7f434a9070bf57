//! Mirrors remote workflow objects onto local records.
//!
//! Each tick fetches every running workflow that has a `remote_ref` and is
//! not backing off, with at most `max_in_flight` requests outstanding.
//! Unchanged `resourceVersion`s are skipped, and writes happen only when the
//! mapped state differs from what is stored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use idp_core::config::MirrorConfig;
use idp_core::manifest::ResourceRef;
use idp_core::remote::{self, RemoteStatus};
use idp_core::types::WorkflowStatus;
use idp_core::workflow::Workflow;
use idp_core::IdpError;

use crate::cluster_api::ClusterApi;
use crate::error::Result;
use crate::journal::Journal;

#[derive(Debug, Default)]
struct Tracked {
    resource_version: Option<String>,
    failures: u32,
    misses: u32,
    next_poll: Option<Instant>,
}

/// Counters for one tick, mainly for tests and debug logs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub missing: usize,
}

pub struct Mirror {
    api: Arc<dyn ClusterApi>,
    journal: Journal,
    resource: ResourceRef,
    cfg: MirrorConfig,
    // Keyed by remote workflow name, so a retry starts with fresh state.
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl Mirror {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        journal: Journal,
        resource: ResourceRef,
        cfg: MirrorConfig,
    ) -> Self {
        Self {
            api,
            journal,
            resource,
            cfg,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.cfg.interval_secs.max(1))
    }

    /// `interval * 2^failures`, capped at `max_backoff_secs`.
    fn backoff(&self, failures: u32) -> Duration {
        let base = self.cfg.interval_secs.max(1);
        let factor = 1u64 << failures.min(16);
        let cap = self.cfg.max_backoff_secs.max(base);
        Duration::from_secs(base.saturating_mul(factor).min(cap))
    }

    /// Poll until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.cfg.interval_secs, "workflow mirror started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report.fetched > 0 => debug!(?report, "mirror tick"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "mirror tick failed"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("workflow mirror stopped");
    }

    fn due(&self, now: Instant) -> Result<Vec<(Workflow, String)>> {
        let candidates: Vec<(Workflow, String)> = self
            .journal
            .store()
            .list()?
            .into_iter()
            .filter(|w| w.status == WorkflowStatus::Running)
            .filter_map(|w| {
                let name = w.remote_ref.clone()?;
                Some((w, name))
            })
            .collect();

        let mut tracked = self.lock();
        tracked.retain(|name, _| candidates.iter().any(|(_, n)| n == name));
        Ok(candidates
            .into_iter()
            .filter(|(_, name)| {
                tracked
                    .get(name)
                    .and_then(|t| t.next_poll)
                    .is_none_or(|at| at <= now)
            })
            .collect())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Tracked>> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One reconciliation pass.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = Instant::now();
        let due = self.due(now)?;
        let mut report = TickReport {
            fetched: due.len(),
            ..Default::default()
        };

        let limit = self.cfg.max_in_flight.max(1);
        let results: Vec<_> = stream::iter(due)
            .map(|(wf, name)| async move {
                let fetched = self.api.get(&self.resource, &name).await;
                (wf, name, fetched)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        for (wf, name, fetched) in results {
            match fetched {
                Ok(Some(obj)) => match self.observe(&wf, &name, &obj) {
                    Ok(true) => report.updated += 1,
                    Ok(false) => report.unchanged += 1,
                    Err(e) => {
                        report.errors += 1;
                        warn!(workflow = %wf.id, remote = %name, error = %e, "failed to reconcile remote workflow");
                    }
                },
                Ok(None) => {
                    report.missing += 1;
                    self.missing(&wf, &name)?;
                }
                Err(e) => {
                    report.errors += 1;
                    let mut tracked = self.lock();
                    let t = tracked.entry(name.clone()).or_default();
                    t.failures += 1;
                    let delay = self.backoff(t.failures);
                    t.next_poll = Some(now + delay);
                    warn!(
                        workflow = %wf.id,
                        remote = %name,
                        failures = t.failures,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "failed to fetch remote workflow"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Apply a fetched object. Returns whether the local record changed.
    fn observe(&self, wf: &Workflow, name: &str, obj: &Value) -> Result<bool> {
        let status = RemoteStatus::from_object(obj);
        {
            let mut tracked = self.lock();
            let t = tracked.entry(name.to_string()).or_default();
            t.failures = 0;
            t.misses = 0;
            t.next_poll = None;
            if status.resource_version.is_some() && t.resource_version == status.resource_version {
                return Ok(false);
            }
        }

        // Dry reconcile against the snapshot to avoid redundant writes.
        let mut probe = wf.clone();
        let preview = remote::reconcile(&mut probe, &status, Utc::now())?;
        if preview.is_empty() {
            self.remember(name, &status);
            return Ok(false);
        }

        let mut applied = None;
        let written = self.journal.update(&wf.id, |w| {
            applied = Some(remote::reconcile(w, &status, Utc::now())?);
            Ok(())
        });
        match written {
            Ok(_) => {}
            Err(IdpError::WorkflowNotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        self.remember(name, &status);
        let Some(applied) = applied else {
            return Ok(false);
        };

        for step in &applied.steps_changed {
            debug!(workflow = %wf.id, step = %step, "step updated from remote");
        }
        match applied.finished {
            Some(WorkflowStatus::Succeeded) => {
                self.journal
                    .info(&wf.id, format!("Remote workflow {name} succeeded"));
                info!(workflow = %wf.id, remote = %name, "remote workflow succeeded");
            }
            Some(WorkflowStatus::Failed) => {
                let reason = status.message.as_deref().unwrap_or("no message");
                self.journal
                    .error(&wf.id, format!("Remote workflow {name} failed: {reason}"));
                info!(workflow = %wf.id, remote = %name, "remote workflow failed");
            }
            _ => {}
        }
        Ok(!applied.is_empty())
    }

    fn remember(&self, name: &str, status: &RemoteStatus) {
        if let Some(t) = self.lock().get_mut(name) {
            t.resource_version = status.resource_version.clone();
        }
    }

    fn missing(&self, wf: &Workflow, name: &str) -> Result<()> {
        let misses = {
            let mut tracked = self.lock();
            let t = tracked.entry(name.to_string()).or_default();
            t.misses += 1;
            t.misses
        };
        if misses < self.cfg.missing_threshold.max(1) {
            warn!(workflow = %wf.id, remote = %name, misses, "remote workflow not found");
            return Ok(());
        }

        let message = format!("remote workflow {name} not found");
        match self.journal.update(&wf.id, |w| w.fail(message.clone())) {
            Ok(_) => self.journal.error(&wf.id, message),
            Err(IdpError::InvalidTransition { .. }) | Err(IdpError::WorkflowNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
