use crate::error::{IdpError, Result};
use crate::node_pool::NodePoolTable;
use crate::types::WorkflowType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "idp.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// How accepted workflows are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Run every step in-process against the cluster API.
    #[default]
    Direct,
    /// Submit a remote workflow object and mirror its status.
    Delegated,
}

impl std::str::FromStr for EngineMode {
    type Err = IdpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(EngineMode::Direct),
            "delegated" => Ok(EngineMode::Delegated),
            _ => Err(IdpError::Validation(format!(
                "unknown engine mode '{s}' (expected direct or delegated)"
            ))),
        }
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EngineMode::Direct => "direct",
            EngineMode::Delegated => "delegated",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: EngineMode,
    /// Remote workflow template per workflow type (delegated mode).
    #[serde(default = "default_templates")]
    pub templates: HashMap<String, String>,
    /// Service account the remote workflow runs as.
    #[serde(default = "default_service_account")]
    pub service_account: String,
}

fn default_templates() -> HashMap<String, String> {
    WorkflowType::all()
        .iter()
        .map(|t| (t.as_str().to_string(), format!("{t}-template")))
        .collect()
}

fn default_service_account() -> String {
    "idp-workflow".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::default(),
            templates: default_templates(),
            service_account: default_service_account(),
        }
    }
}

impl EngineConfig {
    pub fn template_for(&self, workflow_type: WorkflowType) -> String {
        self.templates
            .get(workflow_type.as_str())
            .cloned()
            .unwrap_or_else(|| format!("{workflow_type}-template"))
    }
}

// ---------------------------------------------------------------------------
// NamespacesConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespacesConfig {
    #[serde(default = "default_infrastructure_ns")]
    pub infrastructure: String,
    #[serde(default = "default_workflows_ns")]
    pub workflows: String,
    #[serde(default = "default_gitops_ns")]
    pub gitops: String,
}

fn default_infrastructure_ns() -> String {
    "azure-system".to_string()
}

fn default_workflows_ns() -> String {
    "argo".to_string()
}

fn default_gitops_ns() -> String {
    "flux-system".to_string()
}

impl Default for NamespacesConfig {
    fn default() -> Self {
        Self {
            infrastructure: default_infrastructure_ns(),
            workflows: default_workflows_ns(),
            gitops: default_gitops_ns(),
        }
    }
}

// ---------------------------------------------------------------------------
// AzureConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    /// Secret the Azure operator reads credentials from.
    #[serde(default = "default_credential_secret")]
    pub credential_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Default tags applied to every Azure resource.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

fn default_credential_secret() -> String {
    "aso-credential".to_string()
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            credential_secret: default_credential_secret(),
            subscription_id: None,
            tags: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// MirrorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Consecutive not-found polls before a workflow is failed.
    #[serde(default = "default_missing_threshold")]
    pub missing_threshold: u32,
}

fn default_interval() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    60
}

fn default_max_in_flight() -> usize {
    8
}

fn default_missing_threshold() -> u32 {
    3
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_backoff_secs: default_max_backoff(),
            max_in_flight: default_max_in_flight(),
            missing_threshold: default_missing_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReadinessConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_readiness_interval")]
    pub check_interval_secs: u64,
}

fn default_readiness_timeout() -> u64 {
    1800
}

fn default_readiness_interval() -> u64 {
    30
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_readiness_timeout(),
            check_interval_secs: default_readiness_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// GitOpsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitOpsConfig {
    /// When unset the configure-gitops step logs and succeeds without
    /// applying anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Path inside the repository; `{cluster}` is replaced with the cluster name.
    #[serde(default = "default_path_template")]
    pub path_template: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_path_template() -> String {
    "./clusters/{cluster}".to_string()
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        Self {
            repository_url: None,
            branch: default_branch(),
            path_template: default_path_template(),
        }
    }
}

impl GitOpsConfig {
    pub fn path_for(&self, cluster: &str) -> String {
        self.path_template.replace("{cluster}", cluster)
    }
}

// ---------------------------------------------------------------------------
// LogsConfig / StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
}

fn default_log_capacity() -> usize {
    crate::log::DEFAULT_LOG_CAPACITY
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redb,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file for the redb backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub namespaces: NamespacesConfig,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub gitops: GitOpsConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Overrides merged over the built-in node-pool table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pools: Option<NodePoolTable>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load `path` if given, otherwise `./idp.yaml` if present, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let local = Path::new(CONFIG_FILE);
                if local.exists() {
                    Self::load(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Built-in node pools with any configured overrides applied.
    pub fn node_pool_table(&self) -> NodePoolTable {
        let base = NodePoolTable::default();
        match &self.node_pools {
            Some(overrides) => base.merged(overrides),
            None => base,
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for key in self.engine.templates.keys() {
            if key.parse::<WorkflowType>().is_err() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("unknown workflow type '{key}' in engine.templates"),
                });
            }
        }

        if self.mirror.interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "mirror.interval_secs must be greater than zero".into(),
            });
        }
        if self.mirror.max_backoff_secs < self.mirror.interval_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "mirror.max_backoff_secs is below mirror.interval_secs; backoff disabled"
                    .into(),
            });
        }
        if self.mirror.max_in_flight == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "mirror.max_in_flight must be greater than zero".into(),
            });
        }
        if self.readiness.check_interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "readiness.check_interval_secs must be greater than zero".into(),
            });
        }
        if self.logs.capacity == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "logs.capacity is 0; only the latest entry is kept".into(),
            });
        }
        if self.store.backend == StoreBackend::Redb && self.store.path.is_none() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "store.backend is redb but store.path is not set".into(),
            });
        }
        if let Some(url) = &self.gitops.repository_url {
            if !(url.starts_with("https://") || url.starts_with("ssh://")) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("gitops.repository_url '{url}' is not an https or ssh URL"),
                });
            }
        }

        warnings
    }

    pub fn has_errors(&self) -> bool {
        self.validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_yaml_yields_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.engine.mode, EngineMode::Direct);
        assert_eq!(cfg.mirror.interval_secs, 5);
        assert_eq!(cfg.namespaces.infrastructure, "azure-system");
        assert_eq!(cfg.logs.capacity, 1000);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg: Config = serde_yaml::from_str(
            r#"
engine:
  mode: delegated
mirror:
  interval_secs: 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.engine.mode, EngineMode::Delegated);
        assert_eq!(cfg.mirror.interval_secs, 2);
        assert_eq!(cfg.mirror.max_backoff_secs, 60);
        assert_eq!(
            cfg.engine.template_for(WorkflowType::ClusterProvisioning),
            "cluster-provisioning-template"
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut cfg = Config::default();
        cfg.engine.mode = EngineMode::Delegated;
        cfg.gitops.repository_url = Some("https://example.com/fleet.git".into());
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.engine.mode, EngineMode::Delegated);
        assert_eq!(
            loaded.gitops.repository_url.as_deref(),
            Some("https://example.com/fleet.git")
        );
    }

    #[test]
    fn validate_flags_bad_values() {
        let mut cfg = Config::default();
        cfg.mirror.interval_secs = 0;
        cfg.store.backend = StoreBackend::Redb;
        cfg.engine
            .templates
            .insert("cluster-upgrade".into(), "x".into());
        let warnings = cfg.validate();
        assert!(cfg.has_errors());
        assert!(warnings.iter().any(|w| w.message.contains("interval_secs")));
        assert!(warnings.iter().any(|w| w.message.contains("store.path")));
        assert!(warnings.iter().any(|w| w.message.contains("cluster-upgrade")));
    }

    #[test]
    fn engine_mode_parses() {
        assert_eq!("delegated".parse::<EngineMode>().unwrap(), EngineMode::Delegated);
        assert!("argo".parse::<EngineMode>().is_err());
    }

    #[test]
    fn gitops_path_substitutes_cluster() {
        let g = GitOpsConfig::default();
        assert_eq!(g.path_for("demo"), "./clusters/demo");
    }
}
