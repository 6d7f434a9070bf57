//! In-memory `ClusterApi` that records every call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use idp_core::manifest::{Manifest, ResourceRef};

use crate::cluster_api::{Applied, ClusterApi, Deleted};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { kind: String, name: String },
    Apply { kind: String, name: String },
    Get { kind: String, name: String },
    Delete { kind: String, name: String },
}

impl Call {
    pub fn kind(&self) -> &str {
        match self {
            Call::Create { kind, .. }
            | Call::Apply { kind, .. }
            | Call::Get { kind, .. }
            | Call::Delete { kind, .. } => kind,
        }
    }
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    objects: HashMap<(String, String), Value>,
    create_errors: HashMap<String, String>,
    delete_error: Option<String>,
    get_errors: u32,
    not_ready: HashSet<String>,
    hold: Option<Arc<Notify>>,
}

/// Objects created through the fake report `provisioningState: Succeeded`
/// unless their kind was marked with [`FakeClusterApi::keep_pending`].
#[derive(Default)]
pub struct FakeClusterApi {
    state: Mutex<State>,
    reached: Notify,
}

fn key(kind: &str, name: &str) -> (String, String) {
    (kind.to_string(), name.to_string())
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Create and apply calls, i.e. everything that mutates.
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Create { .. } | Call::Apply { .. } | Call::Delete { .. }))
            .collect()
    }

    pub fn put(&self, kind: &str, name: &str, obj: Value) {
        self.lock().objects.insert(key(kind, name), obj);
    }

    pub fn object(&self, kind: &str, name: &str) -> Option<Value> {
        self.lock().objects.get(&key(kind, name)).cloned()
    }

    pub fn fail_create(&self, kind: &str, message: &str) {
        self.lock()
            .create_errors
            .insert(kind.to_string(), message.to_string());
    }

    pub fn fail_delete(&self, message: &str) {
        self.lock().delete_error = Some(message.to_string());
    }

    /// Fail the next `n` `get` calls.
    pub fn fail_gets(&self, n: u32) {
        self.lock().get_errors = n;
    }

    pub fn keep_pending(&self, kind: &str) {
        self.lock().not_ready.insert(kind.to_string());
    }

    pub fn remove(&self, kind: &str, name: &str) {
        self.lock().objects.remove(&key(kind, name));
    }

    /// Park the next `create` until the returned gate is notified.
    pub fn hold_creates(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().hold = Some(gate.clone());
        gate
    }

    /// Resolves once a held `create` is parked.
    pub async fn create_reached(&self) {
        self.reached.notified().await;
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        let mut s = self.lock();
        s.create_errors.clear();
        s.delete_error = None;
        s.get_errors = 0;
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn create(&self, manifest: &Manifest) -> Result<Applied> {
        let gate = self.lock().hold.take();
        if let Some(gate) = gate {
            self.reached.notify_one();
            gate.notified().await;
        }
        let mut s = self.lock();
        let kind = manifest.resource.kind.clone();
        s.calls.push(Call::Create {
            kind: kind.clone(),
            name: manifest.name.clone(),
        });
        if let Some(message) = s.create_errors.get(&kind) {
            return Err(EngineError::ClusterApi(message.clone()));
        }
        let k = key(&kind, &manifest.name);
        if s.objects.contains_key(&k) {
            return Ok(Applied::AlreadyExists);
        }
        let mut body = manifest.body.clone();
        if !s.not_ready.contains(&kind) {
            body["status"] = json!({ "provisioningState": "Succeeded" });
        }
        s.objects.insert(k, body);
        Ok(Applied::Created)
    }

    async fn apply(&self, manifest: &Manifest) -> Result<()> {
        let mut s = self.lock();
        s.calls.push(Call::Apply {
            kind: manifest.resource.kind.clone(),
            name: manifest.name.clone(),
        });
        s.objects.insert(
            key(&manifest.resource.kind, &manifest.name),
            manifest.body.clone(),
        );
        Ok(())
    }

    async fn get(&self, resource: &ResourceRef, name: &str) -> Result<Option<Value>> {
        let mut s = self.lock();
        s.calls.push(Call::Get {
            kind: resource.kind.clone(),
            name: name.to_string(),
        });
        if s.get_errors > 0 {
            s.get_errors -= 1;
            return Err(EngineError::ClusterApi("connection refused".into()));
        }
        Ok(s.objects.get(&key(&resource.kind, name)).cloned())
    }

    async fn delete(&self, resource: &ResourceRef, name: &str) -> Result<Deleted> {
        let mut s = self.lock();
        s.calls.push(Call::Delete {
            kind: resource.kind.clone(),
            name: name.to_string(),
        });
        if let Some(message) = &s.delete_error {
            return Err(EngineError::ClusterApi(message.clone()));
        }
        match s.objects.remove(&key(&resource.kind, name)) {
            Some(_) => Ok(Deleted::Deleted),
            None => Ok(Deleted::NotFound),
        }
    }
}
