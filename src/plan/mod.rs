//! Deployment plan data model
//!
//! A [`DeployPlan`] is produced by an external planner and is read-only here.
//! [`exchange`] projects it onto individual devices as [`ExchangePlan`]s.

pub mod exchange;

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use exchange::{build_exchange_plan, DeviceExchangePlan, ExchangePlan, QueueDesc};

/// Accelerator device ordinal on its host
pub type DeviceId = i32;

/// Node index of the orchestrator host
pub const LOCAL_NODE_ID: u32 = 0;

/// Globally unique device identity: (node, device ordinal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub node_id: u32,
    pub device_id: DeviceId,
}

impl DeviceKey {
    pub fn new(node_id: u32, device_id: DeviceId) -> Self {
        Self { node_id, device_id }
    }

    pub fn local(device_id: DeviceId) -> Self {
        Self::new(LOCAL_NODE_ID, device_id)
    }

    /// Devices on the orchestrator node are deployed in-process
    pub fn is_local(&self) -> bool {
        self.node_id == LOCAL_NODE_ID
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    Npu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub key: DeviceKey,
    pub device_type: DeviceType,
    /// Data-plane address peers use for tag endpoints
    pub address: String,
}

impl DeviceInfo {
    /// Stand-in device used when execution is host-only
    pub fn host_pseudo_device(address: impl Into<String>) -> Self {
        Self {
            key: DeviceKey::local(0),
            device_type: DeviceType::Cpu,
            address: address.into(),
        }
    }
}

/// Placement of one submodel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmodelInfo {
    /// Name of the submodel artifact inside the compiled model
    pub model: String,
    pub device: DeviceKey,
    pub input_queue_indices: Vec<usize>,
    pub output_queue_indices: Vec<usize>,
    #[serde(default)]
    pub control_input_queue_indices: Vec<usize>,
    #[serde(default)]
    pub control_output_queue_indices: Vec<usize>,
}

impl SubmodelInfo {
    fn all_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.input_queue_indices
            .iter()
            .chain(&self.output_queue_indices)
            .chain(&self.control_input_queue_indices)
            .chain(&self.control_output_queue_indices)
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub depth: u32,
    pub device: DeviceKey,
    /// Created by this deployment; otherwise resolved by name
    pub owned_locally: bool,
}

/// Placement and wiring blueprint for one model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployPlan {
    pub devices: Vec<DeviceInfo>,
    pub submodels: BTreeMap<String, SubmodelInfo>,
    pub queues: Vec<QueueInfo>,
    pub bindings: Vec<(usize, usize)>,
    /// Group slot in `queues` -> member queue indices
    pub groups: BTreeMap<usize, Vec<usize>>,
    pub input_queue_indices: Vec<usize>,
    pub output_queue_indices: Vec<usize>,
    #[serde(default)]
    pub control_input_queue_indices: Vec<usize>,
    #[serde(default)]
    pub control_output_queue_indices: Vec<usize>,
}

impl DeployPlan {
    pub fn is_group(&self, index: usize) -> bool {
        self.groups.contains_key(&index)
    }

    pub fn device_info(&self, key: &DeviceKey) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.key == *key)
    }

    fn check_index(&self, index: usize, what: &str) -> Result<()> {
        if index >= self.queues.len() {
            return Err(DeployError::InvalidParam(format!(
                "{} references queue index {} but the plan has {} queues",
                what,
                index,
                self.queues.len()
            )));
        }
        Ok(())
    }

    /// Reject plans whose indices fall outside the queue list or whose groups
    /// cannot be placed
    pub fn validate(&self) -> Result<()> {
        for (src, dst) in &self.bindings {
            self.check_index(*src, "binding")?;
            self.check_index(*dst, "binding")?;
            if self.is_group(*src) && self.is_group(*dst) {
                return Err(DeployError::Internal(format!(
                    "group {} cannot be bound directly to group {}",
                    src, dst
                )));
            }
            // Groups sit on the device of the endpoint they fan in to or out of
            if self.is_group(*src) && self.queues[*src].device != self.queues[*dst].device {
                return Err(DeployError::InvalidParam(format!(
                    "group {} is not placed on the device of its destination {}",
                    src, dst
                )));
            }
            if self.is_group(*dst) && self.queues[*dst].device != self.queues[*src].device {
                return Err(DeployError::InvalidParam(format!(
                    "group {} is not placed on the device of its source {}",
                    dst, src
                )));
            }
        }
        for (group, members) in &self.groups {
            self.check_index(*group, "group")?;
            for member in members {
                self.check_index(*member, "group member")?;
                if self.is_group(*member) {
                    return Err(DeployError::InvalidParam(format!(
                        "group {} contains nested group {}",
                        group, member
                    )));
                }
            }
        }
        for (name, submodel) in &self.submodels {
            for index in submodel.all_indices() {
                self.check_index(index, &format!("submodel {}", name))?;
            }
        }
        for index in self
            .input_queue_indices
            .iter()
            .chain(&self.output_queue_indices)
            .chain(&self.control_input_queue_indices)
            .chain(&self.control_output_queue_indices)
        {
            self.check_index(*index, "model root")?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_valid_plan_passes() {
        two_node_plan().validate().unwrap();
    }

    #[test]
    fn test_out_of_range_binding_rejected() {
        let mut plan = two_node_plan();
        plan.bindings.push((0, 99));
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, DeployError::InvalidParam(_)));
    }

    #[test]
    fn test_group_to_group_rejected() {
        let mut plan = two_node_plan();
        let local = DeviceKey::local(0);
        plan.queues.push(queue("g1", local));
        plan.queues.push(queue("g2", local));
        plan.groups.insert(5, vec![0]);
        plan.groups.insert(6, vec![4]);
        plan.bindings.push((5, 6));
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, DeployError::Internal(_)));
    }

    #[test]
    fn test_locality_is_by_node() {
        assert!(DeviceKey::local(3).is_local());
        assert!(!DeviceKey::new(2, 0).is_local());
        assert_eq!(DeviceKey::new(2, 1).to_string(), "2:1");
    }
}
