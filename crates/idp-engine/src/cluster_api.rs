//! The seam between the engines and the Kubernetes API.
//!
//! Everything the engines and the mirror do against a cluster goes through
//! [`ClusterApi`], so tests can substitute a recording fake.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use serde_json::Value;

use idp_core::manifest::{Manifest, ResourceRef, MANAGED_BY};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deleted {
    Deleted,
    NotFound,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create the object. A 409 is reported as `Applied::AlreadyExists`.
    async fn create(&self, manifest: &Manifest) -> Result<Applied>;

    /// Server-side apply; creates or merges.
    async fn apply(&self, manifest: &Manifest) -> Result<()>;

    async fn get(&self, resource: &ResourceRef, name: &str) -> Result<Option<Value>>;

    async fn delete(&self, resource: &ResourceRef, name: &str) -> Result<Deleted>;
}

// ---------------------------------------------------------------------------
// kube-rs implementation
// ---------------------------------------------------------------------------

pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the in-cluster config or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| EngineError::ClusterApi(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn api(&self, resource: &ResourceRef) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: resource.group.clone(),
            version: resource.version.clone(),
            kind: resource.kind.clone(),
            api_version: resource.api_version(),
            plural: resource.plural.clone(),
        };
        match &resource.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn api_err(e: kube::Error) -> EngineError {
    EngineError::ClusterApi(e.to_string())
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create(&self, manifest: &Manifest) -> Result<Applied> {
        let obj: DynamicObject = serde_json::from_value(manifest.body.clone())?;
        match self
            .api(&manifest.resource)
            .create(&PostParams::default(), &obj)
            .await
        {
            Ok(_) => Ok(Applied::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Applied::AlreadyExists),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn apply(&self, manifest: &Manifest) -> Result<()> {
        let params = PatchParams::apply(MANAGED_BY).force();
        self.api(&manifest.resource)
            .patch(&manifest.name, &params, &Patch::Apply(&manifest.body))
            .await
            .map_err(api_err)?;
        Ok(())
    }

    async fn get(&self, resource: &ResourceRef, name: &str) -> Result<Option<Value>> {
        match self.api(resource).get(name).await {
            Ok(obj) => Ok(Some(serde_json::to_value(obj)?)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn delete(&self, resource: &ResourceRef, name: &str) -> Result<Deleted> {
        match self
            .api(resource)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(Deleted::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Deleted::NotFound),
            Err(e) => Err(api_err(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Disconnected
// ---------------------------------------------------------------------------

/// Used when no cluster connection could be established at startup. Dry-run
/// requests still work; every real call fails with the original reason.
pub struct Unavailable {
    reason: String,
}

impl Unavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn err(&self) -> EngineError {
        EngineError::ClusterApi(format!("no cluster connection: {}", self.reason))
    }
}

#[async_trait]
impl ClusterApi for Unavailable {
    async fn create(&self, _manifest: &Manifest) -> Result<Applied> {
        Err(self.err())
    }

    async fn apply(&self, _manifest: &Manifest) -> Result<()> {
        Err(self.err())
    }

    async fn get(&self, _resource: &ResourceRef, _name: &str) -> Result<Option<Value>> {
        Err(self.err())
    }

    async fn delete(&self, _resource: &ResourceRef, _name: &str) -> Result<Deleted> {
        Err(self.err())
    }
}
