pub mod applier;
pub mod cluster_api;
pub mod engine;
pub mod error;
pub mod journal;
pub mod mirror;
pub mod sequencer;
pub mod service;

pub use cluster_api::{Applied, ClusterApi, Deleted, KubeClusterApi, Unavailable};
pub use error::{EngineError, Result};
pub use journal::{Journal, WorkflowEvent};
pub use mirror::Mirror;
pub use sequencer::RunOutcome;
pub use service::{Launch, ListFilter, WorkflowService};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
