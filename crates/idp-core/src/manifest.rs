//! Manifest builders for every resource the applier submits.
//!
//! Builders are pure: they take validated parameters plus configuration and
//! return a `Manifest`. The engine decides whether to submit it or, in
//! dry-run mode, only log it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::Result;
use crate::node_pool::{NodePoolConfig, NodePoolTable};
use crate::params::{ClusterParams, NamespaceParams, WorkflowParams};
use crate::workflow::Workflow;

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "idp-platform";
pub const LABEL_WORKFLOW_ID: &str = "idp.platform/workflow-id";
pub const LABEL_WORKFLOW_TYPE: &str = "idp.platform/workflow-type";
pub const LABEL_CLUSTER: &str = "idp.platform/cluster";
pub const LABEL_TEAM: &str = "idp.platform/team";
pub const CREDENTIAL_ANNOTATION: &str = "serviceoperator.azure.com/credential-from";

pub const DEFAULT_CPU_QUOTA: &str = "4";
pub const DEFAULT_MEMORY_QUOTA: &str = "8Gi";

// ---------------------------------------------------------------------------
// ResourceRef
// ---------------------------------------------------------------------------

/// Group/version/kind coordinates plus the namespace a resource lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
}

impl ResourceRef {
    fn new(group: &str, version: &str, kind: &str, plural: &str, ns: Option<&str>) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespace: ns.map(str::to_string),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn resource_group(cfg: &Config) -> Self {
        Self::new(
            "resources.azure.com",
            "v1api20200601",
            "ResourceGroup",
            "resourcegroups",
            Some(&cfg.namespaces.infrastructure),
        )
    }

    pub fn managed_cluster(cfg: &Config) -> Self {
        Self::new(
            "containerservice.azure.com",
            "v1api20240901",
            "ManagedCluster",
            "managedclusters",
            Some(&cfg.namespaces.infrastructure),
        )
    }

    pub fn remote_workflow(cfg: &Config) -> Self {
        Self::new(
            "argoproj.io",
            "v1alpha1",
            "Workflow",
            "workflows",
            Some(&cfg.namespaces.workflows),
        )
    }

    pub fn namespace() -> Self {
        Self::new("", "v1", "Namespace", "namespaces", None)
    }

    pub fn resource_quota(ns: &str) -> Self {
        Self::new("", "v1", "ResourceQuota", "resourcequotas", Some(ns))
    }

    pub fn network_policy(ns: &str) -> Self {
        Self::new(
            "networking.k8s.io",
            "v1",
            "NetworkPolicy",
            "networkpolicies",
            Some(ns),
        )
    }

    pub fn git_repository(cfg: &Config) -> Self {
        Self::new(
            "source.toolkit.fluxcd.io",
            "v1",
            "GitRepository",
            "gitrepositories",
            Some(&cfg.namespaces.gitops),
        )
    }

    pub fn kustomization(cfg: &Config) -> Self {
        Self::new(
            "kustomize.toolkit.fluxcd.io",
            "v1",
            "Kustomization",
            "kustomizations",
            Some(&cfg.namespaces.gitops),
        )
    }
}

/// A manifest ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub resource: ResourceRef,
    pub name: String,
    pub body: Value,
}

impl Manifest {
    /// `Kind: name`, as used in progress logs.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.resource.kind, self.name)
    }
}

fn managed_labels(workflow_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels.insert(LABEL_WORKFLOW_ID.to_string(), workflow_id.to_string());
    labels
}

fn azure_tags(cfg: &Config, p: &ClusterParams, pool: &NodePoolConfig) -> BTreeMap<String, String> {
    let mut tags: BTreeMap<String, String> = cfg
        .azure
        .tags
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    tags.insert("managed-by".into(), MANAGED_BY.into());
    tags.insert("cluster".into(), p.cluster_name.clone());
    tags.insert("node-pool-type".into(), p.node_pool_type.clone());
    tags.insert("sku-family".into(), pool.sku_family.clone());
    tags
}

// ---------------------------------------------------------------------------
// Azure infrastructure
// ---------------------------------------------------------------------------

pub fn resource_group(
    cfg: &Config,
    pools: &NodePoolTable,
    p: &ClusterParams,
    workflow_id: &str,
) -> Result<Manifest> {
    let pool = pools.resolve(&p.node_pool_type)?;
    let resource = ResourceRef::resource_group(cfg);
    let body = json!({
        "apiVersion": resource.api_version(),
        "kind": resource.kind,
        "metadata": {
            "name": p.resource_group,
            "namespace": cfg.namespaces.infrastructure,
            "labels": managed_labels(workflow_id),
            "annotations": { CREDENTIAL_ANNOTATION: cfg.azure.credential_secret },
        },
        "spec": {
            "location": p.location,
            "tags": azure_tags(cfg, p, pool),
        },
    });
    Ok(Manifest {
        resource,
        name: p.resource_group.clone(),
        body,
    })
}

pub fn managed_cluster(
    cfg: &Config,
    pools: &NodePoolTable,
    p: &ClusterParams,
    workflow_id: &str,
) -> Result<Manifest> {
    let pool = pools.resolve(&p.node_pool_type)?;
    let resource = ResourceRef::managed_cluster(cfg);

    let mut user_pool = json!({
        "name": "user",
        "mode": "User",
        "count": p.node_count,
        "vmSize": pool.user_vm_size,
        "osType": "Linux",
        "enableAutoScaling": true,
        "minCount": 1,
        "maxCount": (pool.max_cpu / 4).max(p.node_count),
    });
    if pool.spot {
        user_pool["scaleSetPriority"] = json!("Spot");
        user_pool["scaleSetEvictionPolicy"] = json!("Delete");
        user_pool["spotMaxPrice"] = json!(-1);
    }

    let mut spec = json!({
        "location": p.location,
        "owner": { "name": p.resource_group },
        "dnsPrefix": p.cluster_name,
        "identity": { "type": "SystemAssigned" },
        "agentPoolProfiles": [
            {
                "name": "system",
                "mode": "System",
                "count": p.node_count.min(3),
                "vmSize": pool.system_vm_size,
                "osType": "Linux",
            },
            user_pool,
        ],
        "tags": azure_tags(cfg, p, pool),
    });
    if let Some(v) = &p.kubernetes_version {
        spec["kubernetesVersion"] = json!(v);
    }

    let mut labels = managed_labels(workflow_id);
    labels.insert(LABEL_CLUSTER.to_string(), p.cluster_name.clone());

    let body = json!({
        "apiVersion": resource.api_version(),
        "kind": resource.kind,
        "metadata": {
            "name": p.cluster_name,
            "namespace": cfg.namespaces.infrastructure,
            "labels": labels,
            "annotations": { CREDENTIAL_ANNOTATION: cfg.azure.credential_secret },
        },
        "spec": spec,
    });
    Ok(Manifest {
        resource,
        name: p.cluster_name.clone(),
        body,
    })
}

// ---------------------------------------------------------------------------
// GitOps
// ---------------------------------------------------------------------------

/// Flux `GitRepository` + `Kustomization` for a new cluster, or `None` when
/// no repository is configured.
pub fn gitops(cfg: &Config, p: &ClusterParams, workflow_id: &str) -> Option<[Manifest; 2]> {
    let url = cfg.gitops.repository_url.as_ref()?;
    let repo_ref = ResourceRef::git_repository(cfg);
    let kust_ref = ResourceRef::kustomization(cfg);
    let mut labels = managed_labels(workflow_id);
    labels.insert(LABEL_CLUSTER.to_string(), p.cluster_name.clone());

    let repo = json!({
        "apiVersion": repo_ref.api_version(),
        "kind": repo_ref.kind,
        "metadata": {
            "name": p.cluster_name,
            "namespace": cfg.namespaces.gitops,
            "labels": labels,
        },
        "spec": {
            "interval": "1m",
            "url": url,
            "ref": { "branch": cfg.gitops.branch },
        },
    });
    let kustomization = json!({
        "apiVersion": kust_ref.api_version(),
        "kind": kust_ref.kind,
        "metadata": {
            "name": p.cluster_name,
            "namespace": cfg.namespaces.gitops,
            "labels": labels,
        },
        "spec": {
            "interval": "10m",
            "path": cfg.gitops.path_for(&p.cluster_name),
            "prune": true,
            "sourceRef": { "kind": "GitRepository", "name": p.cluster_name },
            "kubeConfig": { "secretRef": { "name": format!("{}-kubeconfig", p.cluster_name) } },
        },
    });
    Some([
        Manifest {
            resource: repo_ref,
            name: p.cluster_name.clone(),
            body: repo,
        },
        Manifest {
            resource: kust_ref,
            name: p.cluster_name.clone(),
            body: kustomization,
        },
    ])
}

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

pub fn namespace(p: &NamespaceParams, workflow_id: &str) -> Result<Manifest> {
    let mut labels = managed_labels(workflow_id);
    labels.insert(LABEL_CLUSTER.to_string(), p.cluster_name.clone());
    if let Some(team) = &p.team {
        labels.insert(LABEL_TEAM.to_string(), team.clone());
    }
    for (k, v) in &p.labels {
        labels.insert(k.clone(), v.clone());
    }
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(p.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    };
    Ok(Manifest {
        resource: ResourceRef::namespace(),
        name: p.namespace.clone(),
        body: serde_json::to_value(&ns)?,
    })
}

pub fn resource_quota(p: &NamespaceParams, workflow_id: &str) -> Result<Manifest> {
    let name = format!("{}-quota", p.namespace);
    let mut hard = BTreeMap::new();
    hard.insert(
        "requests.cpu".to_string(),
        Quantity(p.cpu_quota.clone().unwrap_or_else(|| DEFAULT_CPU_QUOTA.into())),
    );
    hard.insert(
        "requests.memory".to_string(),
        Quantity(
            p.memory_quota
                .clone()
                .unwrap_or_else(|| DEFAULT_MEMORY_QUOTA.into()),
        ),
    );
    let quota = ResourceQuota {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(p.namespace.clone()),
            labels: Some(managed_labels(workflow_id)),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(Manifest {
        resource: ResourceRef::resource_quota(&p.namespace),
        name,
        body: serde_json::to_value(&quota)?,
    })
}

/// Default policy: allow ingress only from pods in the same namespace.
pub fn network_policy(p: &NamespaceParams, workflow_id: &str) -> Result<Manifest> {
    let name = format!("{}-same-namespace", p.namespace);
    let policy = NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(p.namespace.clone()),
            labels: Some(managed_labels(workflow_id)),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(LabelSelector::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(Manifest {
        resource: ResourceRef::network_policy(&p.namespace),
        name,
        body: serde_json::to_value(&policy)?,
    })
}

// ---------------------------------------------------------------------------
// Remote workflow (delegated mode)
// ---------------------------------------------------------------------------

/// Deterministic remote workflow name: `<prefix>-<target>-<id8>[-r<n>]`.
pub fn remote_workflow_name(workflow: &Workflow, target: &str) -> String {
    let short: String = workflow.id.chars().filter(|c| *c != '-').take(8).collect();
    let mut target: String = target.chars().take(40).collect();
    while target.ends_with('-') {
        target.pop();
    }
    let base = format!("{}-{}-{}", workflow.workflow_type.prefix(), target, short);
    if workflow.retry_count > 0 {
        format!("{base}-r{}", workflow.retry_count)
    } else {
        base
    }
}

/// Flattened `name=value` arguments passed to the remote workflow template.
pub fn remote_arguments(
    params: &WorkflowParams,
    pools: &NodePoolTable,
    workflow_id: &str,
) -> Result<Vec<(String, String)>> {
    let mut args: Vec<(String, String)> = vec![("workflow-id".into(), workflow_id.into())];
    match params {
        WorkflowParams::Cluster(p) => {
            let pool = pools.resolve(&p.node_pool_type)?;
            args.extend([
                ("cluster-name".into(), p.cluster_name.clone()),
                ("location".into(), p.location.clone()),
                ("resource-group".into(), p.resource_group.clone()),
                ("node-pool-type".into(), p.node_pool_type.clone()),
                ("node-count".into(), p.node_count.to_string()),
                ("system-vm-size".into(), pool.system_vm_size.clone()),
                ("user-vm-size".into(), pool.user_vm_size.clone()),
                ("sku-family".into(), pool.sku_family.clone()),
                ("max-cpu".into(), pool.max_cpu.to_string()),
                ("max-memory-gb".into(), pool.max_memory_gb.to_string()),
                ("spot".into(), pool.spot.to_string()),
            ]);
            if let Some(v) = &p.kubernetes_version {
                args.push(("kubernetes-version".into(), v.clone()));
            }
        }
        WorkflowParams::ClusterDeletion(p) => {
            args.extend([
                ("cluster-name".into(), p.cluster_name.clone()),
                ("resource-group".into(), p.resource_group.clone()),
            ]);
        }
        WorkflowParams::Namespace(p) => {
            args.extend([
                ("namespace".into(), p.namespace.clone()),
                ("cluster-name".into(), p.cluster_name.clone()),
                ("team".into(), p.team.clone().unwrap_or_default()),
                (
                    "cpu-quota".into(),
                    p.cpu_quota.clone().unwrap_or_else(|| DEFAULT_CPU_QUOTA.into()),
                ),
                (
                    "memory-quota".into(),
                    p.memory_quota
                        .clone()
                        .unwrap_or_else(|| DEFAULT_MEMORY_QUOTA.into()),
                ),
            ]);
        }
        WorkflowParams::NamespaceDeletion(p) => {
            args.extend([
                ("namespace".into(), p.namespace.clone()),
                ("cluster-name".into(), p.cluster_name.clone()),
            ]);
        }
    }
    Ok(args)
}

pub fn remote_workflow(
    cfg: &Config,
    pools: &NodePoolTable,
    workflow: &Workflow,
    params: &WorkflowParams,
) -> Result<Manifest> {
    let resource = ResourceRef::remote_workflow(cfg);
    let name = remote_workflow_name(workflow, params.target());
    let parameters: Vec<Value> = remote_arguments(params, pools, &workflow.id)?
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut labels = managed_labels(&workflow.id);
    labels.insert(
        LABEL_WORKFLOW_TYPE.to_string(),
        workflow.workflow_type.as_str().to_string(),
    );

    let body = json!({
        "apiVersion": resource.api_version(),
        "kind": resource.kind,
        "metadata": {
            "name": name,
            "namespace": cfg.namespaces.workflows,
            "labels": labels,
        },
        "spec": {
            "workflowTemplateRef": { "name": cfg.engine.template_for(workflow.workflow_type) },
            "serviceAccountName": cfg.engine.service_account,
            "arguments": { "parameters": parameters },
        },
    });
    Ok(Manifest {
        resource,
        name,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkflowType;
    use serde_json::Map;

    fn params() -> ClusterParams {
        ClusterParams {
            cluster_name: "demo".into(),
            location: "eastus".into(),
            node_pool_type: "standard".into(),
            node_count: 3,
            kubernetes_version: Some("1.30".into()),
            resource_group: "rg-demo".into(),
        }
    }

    #[test]
    fn resource_group_manifest_shape() {
        let cfg = Config::default();
        let m = resource_group(&cfg, &NodePoolTable::default(), &params(), "wf-1").unwrap();
        assert_eq!(m.describe(), "ResourceGroup: rg-demo");
        assert_eq!(m.body["apiVersion"], "resources.azure.com/v1api20200601");
        assert_eq!(m.body["metadata"]["namespace"], "azure-system");
        assert_eq!(m.body["spec"]["location"], "eastus");
        assert_eq!(m.body["spec"]["tags"]["sku-family"], "standardDSv3Family");
        assert_eq!(m.body["metadata"]["labels"][LABEL_WORKFLOW_ID], "wf-1");
    }

    #[test]
    fn managed_cluster_uses_node_pool_sizes() {
        let cfg = Config::default();
        let m = managed_cluster(&cfg, &NodePoolTable::default(), &params(), "wf-1").unwrap();
        assert_eq!(m.describe(), "ManagedCluster: demo");
        let pools = m.body["spec"]["agentPoolProfiles"].as_array().unwrap();
        assert_eq!(pools[0]["vmSize"], "Standard_D2s_v3");
        assert_eq!(pools[1]["vmSize"], "Standard_D4s_v3");
        assert_eq!(m.body["spec"]["owner"]["name"], "rg-demo");
        assert_eq!(m.body["spec"]["kubernetesVersion"], "1.30");
        assert!(pools[1].get("scaleSetPriority").is_none());
    }

    #[test]
    fn spot_pool_sets_priority() {
        let cfg = Config::default();
        let mut p = params();
        p.node_pool_type = "spot-optimized".into();
        let m = managed_cluster(&cfg, &NodePoolTable::default(), &p, "wf-1").unwrap();
        assert_eq!(m.body["spec"]["agentPoolProfiles"][1]["scaleSetPriority"], "Spot");
    }

    #[test]
    fn gitops_requires_repository() {
        let mut cfg = Config::default();
        assert!(gitops(&cfg, &params(), "wf-1").is_none());
        cfg.gitops.repository_url = Some("https://example.com/fleet.git".into());
        let [repo, kust] = gitops(&cfg, &params(), "wf-1").unwrap();
        assert_eq!(repo.body["spec"]["url"], "https://example.com/fleet.git");
        assert_eq!(kust.body["spec"]["path"], "./clusters/demo");
    }

    #[test]
    fn namespace_manifests_serialize_type_meta() {
        let p = NamespaceParams {
            namespace: "team-a".into(),
            cluster_name: "demo".into(),
            team: Some("payments".into()),
            cpu_quota: None,
            memory_quota: Some("16Gi".into()),
            labels: BTreeMap::new(),
        };
        let ns = namespace(&p, "wf-2").unwrap();
        assert_eq!(ns.body["kind"], "Namespace");
        assert_eq!(ns.body["metadata"]["labels"][LABEL_TEAM], "payments");

        let quota = resource_quota(&p, "wf-2").unwrap();
        assert_eq!(quota.body["spec"]["hard"]["requests.cpu"], "4");
        assert_eq!(quota.body["spec"]["hard"]["requests.memory"], "16Gi");
        assert_eq!(quota.resource.namespace.as_deref(), Some("team-a"));

        let np = network_policy(&p, "wf-2").unwrap();
        assert_eq!(np.body["apiVersion"], "networking.k8s.io/v1");
    }

    #[test]
    fn remote_workflow_name_includes_retry() {
        let mut wf = Workflow::new(WorkflowType::ClusterProvisioning, "x", Map::new(), false);
        let first = remote_workflow_name(&wf, "demo");
        assert!(first.starts_with("cp-demo-"), "{first}");
        wf.retry_count = 2;
        let retried = remote_workflow_name(&wf, "demo");
        assert!(retried.ends_with("-r2"), "{retried}");
        assert_ne!(first, retried);
        assert!(crate::params::is_dns_label(&retried));
    }

    #[test]
    fn remote_workflow_references_template() {
        let cfg = Config::default();
        let wf = Workflow::new(WorkflowType::ClusterProvisioning, "x", Map::new(), false);
        let params = WorkflowParams::Cluster(params());
        let m = remote_workflow(&cfg, &NodePoolTable::default(), &wf, &params).unwrap();
        assert_eq!(
            m.body["spec"]["workflowTemplateRef"]["name"],
            "cluster-provisioning-template"
        );
        let args = m.body["spec"]["arguments"]["parameters"].as_array().unwrap();
        assert!(args
            .iter()
            .any(|a| a["name"] == "user-vm-size" && a["value"] == "Standard_D4s_v3"));
        assert_eq!(m.body["metadata"]["namespace"], "argo");
    }
}
