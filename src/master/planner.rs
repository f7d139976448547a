//! Placement seam and the model artifacts the orchestrator deploys

use crate::error::Result;
use crate::plan::{DeployPlan, DeviceInfo};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Weight file a submodel reads at load time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConstant {
    /// Key the weight is shared under on every device
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmodelArtifact {
    pub data: Vec<u8>,
    pub file_constants: Vec<FileConstant>,
}

/// A compiled model split into named submodels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelArtifact {
    pub name: String,
    pub submodels: BTreeMap<String, SubmodelArtifact>,
}

/// Decides which submodel runs where
pub trait Planner: Send + Sync {
    fn plan(&self, model: &ModelArtifact, devices: &[DeviceInfo]) -> Result<DeployPlan>;
}

/// Returns a precomputed plan regardless of the devices offered
pub struct FixedPlanner {
    plan: DeployPlan,
}

impl FixedPlanner {
    pub fn new(plan: DeployPlan) -> Self {
        Self { plan }
    }
}

impl Planner for FixedPlanner {
    fn plan(&self, _model: &ModelArtifact, _devices: &[DeviceInfo]) -> Result<DeployPlan> {
        Ok(self.plan.clone())
    }
}
