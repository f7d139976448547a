// Library interface for hetero-deploy
// The daemon binary, tests and benchmarks all build on these modules

pub mod comm;
pub mod config;
pub mod daemon;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod logging;
pub mod master;
pub mod plan;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use error::{DeployError, ErrorCode, Result};
