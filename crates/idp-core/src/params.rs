//! Request parameter parsing and validation.
//!
//! Requests arrive as an opaque JSON object. Each workflow type has a typed
//! view; `WorkflowParams::parse` builds it and reports every missing field
//! in a single error so the caller can fail the workflow up front.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{IdpError, Result};
use crate::node_pool::NodePoolTable;
use crate::types::WorkflowType;

pub const DEFAULT_NODE_COUNT: u32 = 3;
pub const MAX_NODE_COUNT: u32 = 100;

fn dns_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("valid regex"))
}

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]*$").expect("valid regex"))
}

pub fn is_dns_label(s: &str) -> bool {
    dns_label_re().is_match(s)
}

// ---------------------------------------------------------------------------
// Field collector
// ---------------------------------------------------------------------------

struct Fields<'a> {
    map: &'a Map<String, Value>,
    missing: Vec<&'static str>,
    invalid: Vec<String>,
}

impl<'a> Fields<'a> {
    fn new(map: &'a Map<String, Value>) -> Self {
        Self {
            map,
            missing: Vec::new(),
            invalid: Vec::new(),
        }
    }

    fn optional_str(&mut self, key: &'static str) -> Option<String> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(other) => {
                self.invalid
                    .push(format!("invalid parameter '{key}': expected a string, got {other}"));
                None
            }
        }
    }

    fn required_str(&mut self, key: &'static str) -> String {
        match self.map.get(key) {
            None | Some(Value::Null) => {
                self.missing.push(key);
                String::new()
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                self.missing.push(key);
                String::new()
            }
            _ => self.optional_str(key).unwrap_or_default(),
        }
    }

    fn dns_label(&mut self, key: &'static str, value: &str) {
        if !value.is_empty() && !is_dns_label(value) {
            self.invalid.push(format!(
                "invalid parameter '{key}': '{value}' must be lowercase alphanumeric with hyphens (max 63 chars)"
            ));
        }
    }

    fn optional_u32(&mut self, key: &'static str) -> Option<u32> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_u64().and_then(|v| u32::try_from(v).ok()) {
                Some(v) => Some(v),
                None => {
                    self.invalid
                        .push(format!("invalid parameter '{key}': expected a positive integer"));
                    None
                }
            },
            Some(Value::String(s)) => match s.trim().parse::<u32>() {
                Ok(v) => Some(v),
                Err(_) => {
                    self.invalid
                        .push(format!("invalid parameter '{key}': '{s}' is not an integer"));
                    None
                }
            },
            Some(other) => {
                self.invalid
                    .push(format!("invalid parameter '{key}': expected an integer, got {other}"));
                None
            }
        }
    }

    fn labels(&mut self, key: &'static str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        match self.map.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Object(obj)) => {
                for (k, v) in obj {
                    match v {
                        Value::String(s) => {
                            out.insert(k.clone(), s.clone());
                        }
                        other => self.invalid.push(format!(
                            "invalid parameter '{key}.{k}': expected a string, got {other}"
                        )),
                    }
                }
            }
            Some(other) => self
                .invalid
                .push(format!("invalid parameter '{key}': expected an object, got {other}")),
        }
        out
    }

    fn finish(self) -> Result<()> {
        if !self.missing.is_empty() {
            return Err(IdpError::Validation(format!(
                "missing required parameters: {}",
                self.missing.join(", ")
            )));
        }
        if !self.invalid.is_empty() {
            return Err(IdpError::Validation(self.invalid.join("; ")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed parameter views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterParams {
    pub cluster_name: String,
    pub location: String,
    pub node_pool_type: String,
    pub node_count: u32,
    pub kubernetes_version: Option<String>,
    pub resource_group: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterDeletionParams {
    pub cluster_name: String,
    pub resource_group: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceParams {
    pub namespace: String,
    pub cluster_name: String,
    pub team: Option<String>,
    pub cpu_quota: Option<String>,
    pub memory_quota: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceDeletionParams {
    pub namespace: String,
    pub cluster_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WorkflowParams {
    Cluster(ClusterParams),
    ClusterDeletion(ClusterDeletionParams),
    Namespace(NamespaceParams),
    NamespaceDeletion(NamespaceDeletionParams),
}

/// Default resource group for a cluster: `rg-<cluster>`.
pub fn default_resource_group(cluster_name: &str) -> String {
    format!("rg-{cluster_name}")
}

impl WorkflowParams {
    /// The primary object the workflow acts on (cluster or namespace name).
    pub fn target(&self) -> &str {
        match self {
            WorkflowParams::Cluster(p) => &p.cluster_name,
            WorkflowParams::ClusterDeletion(p) => &p.cluster_name,
            WorkflowParams::Namespace(p) => &p.namespace,
            WorkflowParams::NamespaceDeletion(p) => &p.namespace,
        }
    }

    pub fn parse(
        workflow_type: WorkflowType,
        map: &Map<String, Value>,
        pools: &NodePoolTable,
    ) -> Result<Self> {
        let mut f = Fields::new(map);
        let params = match workflow_type {
            WorkflowType::ClusterProvisioning => {
                let cluster_name = f.required_str("clusterName");
                let location = f.required_str("location");
                let node_pool_type = f.required_str("nodePoolType");
                let node_count = f.optional_u32("nodeCount").unwrap_or(DEFAULT_NODE_COUNT);
                let kubernetes_version = f.optional_str("kubernetesVersion");
                let resource_group = f
                    .optional_str("resourceGroup")
                    .unwrap_or_else(|| default_resource_group(&cluster_name));

                f.dns_label("clusterName", &cluster_name);
                if !location.is_empty() && !location_re().is_match(&location) {
                    f.invalid.push(format!(
                        "invalid parameter 'location': '{location}' is not a region name"
                    ));
                }
                if !node_pool_type.is_empty() && !pools.contains(&node_pool_type) {
                    let known: Vec<_> = pools.keys().collect();
                    f.invalid.push(format!(
                        "invalid parameter 'nodePoolType': '{node_pool_type}' (expected one of {})",
                        known.join(", ")
                    ));
                }
                if node_count == 0 || node_count > MAX_NODE_COUNT {
                    f.invalid.push(format!(
                        "invalid parameter 'nodeCount': {node_count} (expected 1..={MAX_NODE_COUNT})"
                    ));
                }
                WorkflowParams::Cluster(ClusterParams {
                    cluster_name,
                    location,
                    node_pool_type,
                    node_count,
                    kubernetes_version,
                    resource_group,
                })
            }
            WorkflowType::ClusterDeletion => {
                let cluster_name = f.required_str("clusterName");
                let resource_group = f
                    .optional_str("resourceGroup")
                    .unwrap_or_else(|| default_resource_group(&cluster_name));
                f.dns_label("clusterName", &cluster_name);
                WorkflowParams::ClusterDeletion(ClusterDeletionParams {
                    cluster_name,
                    resource_group,
                })
            }
            WorkflowType::NamespaceProvisioning | WorkflowType::NamespaceUpdate => {
                let namespace = f.required_str("namespace");
                let cluster_name = f.required_str("clusterName");
                let team = f.optional_str("team");
                let cpu_quota = f.optional_str("cpuQuota");
                let memory_quota = f.optional_str("memoryQuota");
                let labels = f.labels("labels");
                f.dns_label("namespace", &namespace);
                f.dns_label("clusterName", &cluster_name);
                WorkflowParams::Namespace(NamespaceParams {
                    namespace,
                    cluster_name,
                    team,
                    cpu_quota,
                    memory_quota,
                    labels,
                })
            }
            WorkflowType::NamespaceDeletion => {
                let namespace = f.required_str("namespace");
                let cluster_name = f.required_str("clusterName");
                f.dns_label("namespace", &namespace);
                f.dns_label("clusterName", &cluster_name);
                WorkflowParams::NamespaceDeletion(NamespaceDeletionParams {
                    namespace,
                    cluster_name,
                })
            }
        };
        f.finish()?;
        Ok(params)
    }
}

/// Human-readable workflow name derived from the request, valid or not.
pub fn display_name(workflow_type: WorkflowType, map: &Map<String, Value>) -> String {
    let key = match workflow_type {
        WorkflowType::ClusterProvisioning | WorkflowType::ClusterDeletion => "clusterName",
        _ => "namespace",
    };
    let target = map
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("unnamed");
    format!("{workflow_type}: {target}")
}

/// `dryRun` flag from the request. Accepts booleans and `"true"`/`"false"`.
pub fn dry_run(map: &Map<String, Value>) -> bool {
    match map.get("dryRun") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
