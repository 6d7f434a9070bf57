pub mod events;
pub mod health;
pub mod node_pools;
pub mod resources;
pub mod workflows;
