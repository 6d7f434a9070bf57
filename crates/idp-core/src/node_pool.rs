//! Node-pool reference table.
//!
//! Maps a workload profile (`standard`, `memory-optimized`, …) to the VM
//! sizes and ceilings used when building cluster manifests. Loaded once at
//! startup and read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{IdpError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePoolConfig {
    pub system_vm_size: String,
    pub user_vm_size: String,
    pub sku_family: String,
    pub max_cpu: u32,
    pub max_memory_gb: u32,
    pub description: String,
    #[serde(default)]
    pub spot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePoolTable(BTreeMap<String, NodePoolConfig>);

fn pool(
    system: &str,
    user: &str,
    family: &str,
    max_cpu: u32,
    max_memory_gb: u32,
    description: &str,
    spot: bool,
) -> NodePoolConfig {
    NodePoolConfig {
        system_vm_size: system.to_string(),
        user_vm_size: user.to_string(),
        sku_family: family.to_string(),
        max_cpu,
        max_memory_gb,
        description: description.to_string(),
        spot,
    }
}

impl Default for NodePoolTable {
    fn default() -> Self {
        let mut m = BTreeMap::new();
        m.insert(
            "standard".to_string(),
            pool(
                "Standard_D2s_v3",
                "Standard_D4s_v3",
                "standardDSv3Family",
                100,
                400,
                "General purpose workloads",
                false,
            ),
        );
        m.insert(
            "memory-optimized".to_string(),
            pool(
                "Standard_D2s_v3",
                "Standard_E4s_v3",
                "standardESv3Family",
                100,
                800,
                "Memory intensive workloads such as caches and databases",
                false,
            ),
        );
        m.insert(
            "compute-optimized".to_string(),
            pool(
                "Standard_D2s_v3",
                "Standard_F8s_v2",
                "standardFSv2Family",
                200,
                400,
                "CPU bound batch and build workloads",
                false,
            ),
        );
        m.insert(
            "spot-optimized".to_string(),
            pool(
                "Standard_D2s_v3",
                "Standard_D4s_v3",
                "standardDSv3Family",
                100,
                400,
                "Interruptible workloads on spot capacity",
                true,
            ),
        );
        Self(m)
    }
}

impl NodePoolTable {
    pub fn get(&self, key: &str) -> Option<&NodePoolConfig> {
        self.0.get(key)
    }

    /// Look up `key`, failing with `UnknownNodePool` if absent.
    pub fn resolve(&self, key: &str) -> Result<&NodePoolConfig> {
        self.get(key)
            .ok_or_else(|| IdpError::UnknownNodePool(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodePoolConfig)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlay `overrides` on top of this table; entries with the same key win.
    pub fn merged(mut self, overrides: &NodePoolTable) -> Self {
        for (k, v) in &overrides.0 {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
