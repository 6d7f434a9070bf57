pub mod config;
pub mod node_pools;
pub mod serve;
pub mod workflow;
