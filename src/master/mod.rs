//! Orchestrator side of a deployment
//!
//! The [`DeploymentOrchestrator`] runs on the host that owns the model. It
//! binds routes for devices on its own node in-process and drives every other
//! device through a [`Deployer`] session with that node's daemon.

pub mod deployer;
pub mod loader;
pub mod orchestrator;
pub mod planner;
pub mod weights;

pub use deployer::{Deployer, InProcessDeployer, RemoteDeployer};
pub use loader::{ExecutorLoader, LocalModelLoader, LocalSubmodel};
pub use orchestrator::{DeployResult, DeploymentOrchestrator, OrchestratorConfig};
pub use planner::{FileConstant, FixedPlanner, ModelArtifact, Planner, SubmodelArtifact};
