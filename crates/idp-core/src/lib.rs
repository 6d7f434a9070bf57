pub mod config;
pub mod error;
pub mod io;
pub mod log;
pub mod manifest;
pub mod node_pool;
pub mod params;
pub mod remote;
pub mod store;
pub mod types;
pub mod workflow;

pub use error::{IdpError, Result};
