use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Subcommand};
use serde_json::{json, Map, Value};

use idp_core::log::LogEntry;
use idp_core::types::{WorkflowStatus, WorkflowType};
use idp_core::workflow::Workflow;

use crate::client::ApiClient;
use crate::output::{or_dash, print_json, print_table};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum WorkflowSubcommand {
    /// List workflows, newest first
    List {
        /// Filter by workflow type
        #[arg(long = "type", value_name = "TYPE")]
        workflow_type: Option<WorkflowType>,
        /// Filter by status
        #[arg(long)]
        status: Option<WorkflowStatus>,
    },

    /// Show a workflow and its steps
    Show { id: String },

    /// Print a workflow's log
    Logs { id: String },

    /// Follow a workflow until it finishes; exits non-zero unless it succeeded
    Watch {
        id: String,
        /// Seconds between polls
        #[arg(long, default_value = "2")]
        interval: u64,
    },

    /// Start any workflow type with raw `key=value` parameters
    Create {
        #[arg(value_name = "TYPE")]
        workflow_type: WorkflowType,
        /// Parameter as key=value (repeatable); values that parse as JSON are kept typed
        #[arg(long = "set", value_name = "KEY=VALUE")]
        params: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Provision a managed cluster
    CreateCluster {
        name: String,
        #[arg(long)]
        location: String,
        #[arg(long, default_value = "standard")]
        node_pool_type: String,
        #[arg(long)]
        node_count: Option<u32>,
        #[arg(long)]
        kubernetes_version: Option<String>,
        #[arg(long)]
        resource_group: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete a managed cluster and its resource group
    DeleteCluster {
        name: String,
        #[arg(long)]
        resource_group: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Create a namespace with quota and network policy
    CreateNamespace(NamespaceArgs),

    /// Update a namespace's labels and quota
    UpdateNamespace(NamespaceArgs),

    /// Delete a namespace
    DeleteNamespace {
        name: String,
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        dry_run: bool,
    },

    /// Abort a running workflow
    Abort {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Retry a failed workflow from its first unfinished step
    Retry { id: String },
}

#[derive(Args)]
pub struct NamespaceArgs {
    name: String,
    #[arg(long)]
    cluster: String,
    #[arg(long)]
    team: Option<String>,
    #[arg(long)]
    cpu_quota: Option<String>,
    #[arg(long)]
    memory_quota: Option<String>,
    /// Extra namespace label as key=value (repeatable)
    #[arg(long = "label", value_name = "KEY=VALUE")]
    labels: Vec<String>,
    #[arg(long)]
    dry_run: bool,
}

impl NamespaceArgs {
    fn into_params(self) -> anyhow::Result<Value> {
        let mut labels = Map::new();
        for pair in &self.labels {
            let (k, v) = split_pair(pair)?;
            labels.insert(k.to_string(), Value::String(v.to_string()));
        }
        let mut params = json!({
            "namespace": self.name,
            "clusterName": self.cluster,
            "dryRun": self.dry_run,
        });
        insert_opt(&mut params, "team", self.team);
        insert_opt(&mut params, "cpuQuota", self.cpu_quota);
        insert_opt(&mut params, "memoryQuota", self.memory_quota);
        if !labels.is_empty() {
            params["labels"] = Value::Object(labels);
        }
        Ok(params)
    }
}

fn insert_opt<T: Into<Value>>(params: &mut Value, key: &str, value: Option<T>) {
    if let Some(v) = value {
        params[key] = v.into();
    }
}

fn split_pair(pair: &str) -> anyhow::Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim(), v)),
        _ => bail!("expected KEY=VALUE, got '{pair}'"),
    }
}

/// `--set` values: JSON scalars stay typed, anything else is a string.
fn parse_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(url: &str, subcmd: WorkflowSubcommand, json: bool) -> anyhow::Result<()> {
    let api = ApiClient::new(url);
    match subcmd {
        WorkflowSubcommand::List {
            workflow_type,
            status,
        } => list(&api, workflow_type, status, json),
        WorkflowSubcommand::Show { id } => show(&api, &id, json),
        WorkflowSubcommand::Logs { id } => logs(&api, &id, json),
        WorkflowSubcommand::Watch { id, interval } => watch(&api, &id, interval),
        WorkflowSubcommand::Create {
            workflow_type,
            params,
            dry_run,
        } => {
            let mut body = Map::new();
            for pair in &params {
                let (k, v) = split_pair(pair)?;
                body.insert(k.to_string(), parse_value(v));
            }
            if dry_run {
                body.insert("dryRun".into(), Value::Bool(true));
            }
            let path = format!("/api/workflows/{workflow_type}");
            accepted(api.post(&path, &Value::Object(body))?, json)
        }
        WorkflowSubcommand::CreateCluster {
            name,
            location,
            node_pool_type,
            node_count,
            kubernetes_version,
            resource_group,
            dry_run,
        } => {
            let mut body = json!({
                "clusterName": name,
                "location": location,
                "nodePoolType": node_pool_type,
                "dryRun": dry_run,
            });
            insert_opt(&mut body, "nodeCount", node_count);
            insert_opt(&mut body, "kubernetesVersion", kubernetes_version);
            insert_opt(&mut body, "resourceGroup", resource_group);
            accepted(api.post("/api/clusters", &body)?, json)
        }
        WorkflowSubcommand::DeleteCluster {
            name,
            resource_group,
            dry_run,
        } => {
            let dry = dry_run.to_string();
            let mut query = vec![("dryRun", dry.as_str())];
            if let Some(rg) = resource_group.as_deref() {
                query.push(("resourceGroup", rg));
            }
            accepted(api.delete(&format!("/api/clusters/{name}"), &query)?, json)
        }
        WorkflowSubcommand::CreateNamespace(args) => {
            accepted(api.post("/api/namespaces", &args.into_params()?)?, json)
        }
        WorkflowSubcommand::UpdateNamespace(args) => {
            let path = format!("/api/namespaces/{}", args.name);
            accepted(api.put(&path, &args.into_params()?)?, json)
        }
        WorkflowSubcommand::DeleteNamespace {
            name,
            cluster,
            dry_run,
        } => {
            let dry = dry_run.to_string();
            let query = [("clusterName", cluster.as_str()), ("dryRun", dry.as_str())];
            accepted(api.delete(&format!("/api/namespaces/{name}"), &query)?, json)
        }
        WorkflowSubcommand::Abort { id, reason } => {
            let body = match reason {
                Some(r) => json!({ "reason": r }),
                None => json!({}),
            };
            let wf = api.post(&format!("/api/workflows/{id}/abort"), &body)?;
            report(&wf, "Aborted", json)
        }
        WorkflowSubcommand::Retry { id } => {
            let wf = api.post(&format!("/api/workflows/{id}/retry"), &json!({}))?;
            report(&wf, "Retrying", json)
        }
    }
}

fn decode(value: Value) -> anyhow::Result<Workflow> {
    serde_json::from_value(value).context("unexpected workflow payload")
}

fn accepted(value: Value, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&value);
    }
    let wf = decode(value)?;
    match wf.status {
        WorkflowStatus::Failed => {
            println!("Rejected {} ({})", wf.name, wf.id);
            println!("  {}", wf.error.as_deref().unwrap_or("no error recorded"));
        }
        _ => {
            let suffix = if wf.dry_run { " [dry-run]" } else { "" };
            println!("Accepted {} ({}){suffix}", wf.name, wf.id);
        }
    }
    Ok(())
}

fn report(value: &Value, verb: &str, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(value);
    }
    let wf = decode(value.clone())?;
    println!("{verb} {} ({}): {}", wf.name, wf.id, wf.status);
    Ok(())
}

// ---------------------------------------------------------------------------
// list / show / logs / watch
// ---------------------------------------------------------------------------

fn list(
    api: &ApiClient,
    workflow_type: Option<WorkflowType>,
    status: Option<WorkflowStatus>,
    json: bool,
) -> anyhow::Result<()> {
    let t = workflow_type.map(|t| t.to_string());
    let s = status.map(|s| s.to_string());
    let mut query = Vec::new();
    if let Some(t) = t.as_deref() {
        query.push(("type", t));
    }
    if let Some(s) = s.as_deref() {
        query.push(("status", s));
    }
    let value = api.get("/api/workflows", &query)?;
    if json {
        return print_json(&value);
    }

    let items = value.as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        println!("No workflows.");
        return Ok(());
    }
    let rows = items
        .iter()
        .map(|w| {
            vec![
                w["id"].as_str().unwrap_or_default().to_string(),
                w["name"].as_str().unwrap_or_default().to_string(),
                w["status"].as_str().unwrap_or_default().to_string(),
                format!("{}/{}", w["progress"]["done"], w["progress"]["total"]),
                w["started_at"].as_str().unwrap_or_default().to_string(),
                or_dash(w["error"].as_str()),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "STATUS", "STEPS", "STARTED", "ERROR"], rows);
    Ok(())
}

fn show(api: &ApiClient, id: &str, json: bool) -> anyhow::Result<()> {
    let value = api.get(&format!("/api/workflows/{id}"), &[])?;
    if json {
        return print_json(&value);
    }
    let wf = decode(value)?;
    let (done, total) = wf.progress();
    println!("{} ({})", wf.name, wf.id);
    println!("  status:   {}", wf.status);
    println!("  progress: {done}/{total}");
    if wf.dry_run {
        println!("  dry-run:  yes");
    }
    if wf.retry_count > 0 {
        println!("  retries:  {}", wf.retry_count);
    }
    if let Some(remote) = &wf.remote_ref {
        println!("  remote:   {remote}");
    }
    if let Some(err) = &wf.error {
        println!("  error:    {err}");
    }
    if let Some(reason) = &wf.abort_reason {
        println!("  aborted:  {reason}");
    }
    println!();

    let rows = wf
        .steps
        .iter()
        .map(|s| {
            let mut status = s.status.to_string();
            if s.skipped {
                status.push_str(" (skipped)");
            }
            vec![
                s.name.clone(),
                status,
                or_dash(s.started_at.map(|t| t.to_rfc3339()).as_deref()),
                or_dash(s.ended_at.map(|t| t.to_rfc3339()).as_deref()),
                or_dash(s.error.as_deref()),
            ]
        })
        .collect();
    print_table(&["STEP", "STATUS", "STARTED", "ENDED", "ERROR"], rows);
    Ok(())
}

fn fetch_logs(api: &ApiClient, id: &str) -> anyhow::Result<Vec<LogEntry>> {
    let value = api.get(&format!("/api/workflows/{id}/logs"), &[])?;
    serde_json::from_value(value).context("unexpected log payload")
}

fn print_entry(e: &LogEntry) {
    println!(
        "{} {:5} {}",
        e.timestamp.format("%H:%M:%S"),
        e.level.as_str().to_uppercase(),
        e.message
    );
}

fn logs(api: &ApiClient, id: &str, json: bool) -> anyhow::Result<()> {
    let entries = fetch_logs(api, id)?;
    if json {
        return print_json(&entries);
    }
    for e in &entries {
        print_entry(e);
    }
    Ok(())
}

fn watch(api: &ApiClient, id: &str, interval: u64) -> anyhow::Result<()> {
    let mut last_seen = None;
    loop {
        let entries = fetch_logs(api, id)?;
        // Entries are in order; skip through the last one printed.
        let start = match &last_seen {
            Some(prev) => entries
                .iter()
                .position(|e| e == prev)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        for e in &entries[start..] {
            print_entry(e);
        }
        if let Some(latest) = entries.last() {
            last_seen = Some(latest.clone());
        }

        let wf = decode(api.get(&format!("/api/workflows/{id}"), &[])?)?;
        match wf.status {
            WorkflowStatus::Running => {}
            WorkflowStatus::Succeeded => return Ok(()),
            other => bail!(
                "workflow {} {other}: {}",
                wf.id,
                wf.error
                    .or(wf.abort_reason)
                    .unwrap_or_else(|| "no reason recorded".into())
            ),
        }
        std::thread::sleep(Duration::from_secs(interval.max(1)));
    }
}
