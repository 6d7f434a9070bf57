use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use idp_core::config::{Config, EngineMode, WarnLevel};
use idp_core::store;
use idp_engine::{ClusterApi, KubeClusterApi, Unavailable, WorkflowService};

pub fn run(config_path: Option<&Path>, port: u16, engine: Option<EngineMode>) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(config_path).context("failed to load config")?;
    if let Some(mode) = engine {
        config.engine.mode = mode;
    }

    let warnings = config.validate();
    for w in &warnings {
        warn!(level = ?w.level, "{}", w.message);
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        bail!("config validation found errors; run `idp config validate`");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let store = store::open(&config.store, config.logs.capacity)
            .context("failed to open workflow store")?;
        let recovered = store::recover_interrupted(store.as_ref())?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "failed workflows interrupted by restart");
        }

        let api: Arc<dyn ClusterApi> = match KubeClusterApi::try_default().await {
            Ok(api) => Arc::new(api),
            Err(e) => {
                warn!(error = %e, "no cluster connection; only dry-run workflows can succeed");
                Arc::new(Unavailable::new(e.to_string()))
            }
        };

        let service = WorkflowService::new(config, store, api);
        let shutdown = CancellationToken::new();

        let mirror = Arc::new(service.mirror());
        let mirror_task = tokio::spawn(mirror.run(shutdown.clone()));

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
            }
            signal.cancel();
        });

        let served = idp_server::serve(service, port, shutdown.clone()).await;
        shutdown.cancel();
        let _ = mirror_task.await;
        served
    })
}
