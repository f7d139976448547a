//! Per-device projection of a [`DeployPlan`]
//!
//! Each device only sees the endpoints it hosts plus one tag endpoint per
//! cross-device edge. Endpoint indices are re-numbered densely; the mapping
//! back to plan indices is kept in [`DeviceExchangePlan::queue_indices`].

use super::{DeployPlan, DeviceKey};
use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One endpoint slot of an exchange plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDesc {
    /// Queue created by this deployment on the device
    LocalQueue { name: String, depth: u32 },
    /// Queue that already exists on the device, resolved by name
    ExternalQueue { name: String },
    /// Point-to-point channel to another device for plan edge `edge`
    Tag {
        src: DeviceKey,
        dst: DeviceKey,
        edge: (usize, usize),
        peer_address: String,
    },
    /// Fan-in/fan-out aggregation of other slots
    Group { name: String, members: Vec<usize> },
}

impl QueueDesc {
    pub fn kind_name(&self) -> &'static str {
        match self {
            QueueDesc::LocalQueue { .. } => "local-queue",
            QueueDesc::ExternalQueue { .. } => "external-queue",
            QueueDesc::Tag { .. } => "tag",
            QueueDesc::Group { .. } => "group",
        }
    }
}

/// Wire form sent to a device ahead of deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePlan {
    pub device: DeviceKey,
    pub queues: Vec<QueueDesc>,
    pub bindings: Vec<(usize, usize)>,
    /// Data-plane address of the orchestrator
    pub master_address: String,
    /// Data-plane address of `device` itself
    pub local_address: String,
}

#[derive(Debug, Clone)]
pub struct DeviceExchangePlan {
    pub plan: ExchangePlan,
    /// Plan queue index -> endpoint index in `plan.queues`
    pub queue_indices: HashMap<usize, usize>,
}

impl DeviceExchangePlan {
    pub fn local_index(&self, plan_index: usize) -> Result<usize> {
        self.queue_indices.get(&plan_index).copied().ok_or_else(|| {
            DeployError::InvalidParam(format!(
                "queue {} is not hosted on device {}",
                plan_index, self.plan.device
            ))
        })
    }

    pub fn local_indices(&self, plan_indices: &[usize]) -> Result<Vec<usize>> {
        plan_indices.iter().map(|i| self.local_index(*i)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.queues.is_empty()
    }
}

struct Builder<'a> {
    plan: &'a DeployPlan,
    device: DeviceKey,
    model_id: u32,
    queues: Vec<QueueDesc>,
    queue_indices: HashMap<usize, usize>,
    tag_indices: HashMap<(usize, usize), usize>,
    bindings: Vec<(usize, usize)>,
}

impl<'a> Builder<'a> {
    fn device_of(&self, index: usize) -> DeviceKey {
        self.plan.queues[index].device
    }

    fn push(&mut self, desc: QueueDesc) -> usize {
        self.queues.push(desc);
        self.queues.len() - 1
    }

    fn queue_endpoint(&mut self, index: usize) -> usize {
        if let Some(&local) = self.queue_indices.get(&index) {
            return local;
        }
        let info = &self.plan.queues[index];
        let desc = if info.owned_locally {
            QueueDesc::LocalQueue {
                name: format!("m{}.{}", self.model_id, info.name),
                depth: info.depth,
            }
        } else {
            QueueDesc::ExternalQueue {
                name: info.name.clone(),
            }
        };
        let local = self.push(desc);
        self.queue_indices.insert(index, local);
        local
    }

    fn tag_endpoint(&mut self, edge: (usize, usize), src: DeviceKey, dst: DeviceKey) -> usize {
        if let Some(&local) = self.tag_indices.get(&edge) {
            return local;
        }
        let peer = if src == self.device { dst } else { src };
        let peer_address = self
            .plan
            .device_info(&peer)
            .map(|d| d.address.clone())
            .unwrap_or_default();
        let local = self.push(QueueDesc::Tag {
            src,
            dst,
            edge,
            peer_address,
        });
        self.tag_indices.insert(edge, local);
        local
    }

    fn group_endpoint(&mut self, group: usize, fan_in: bool) -> usize {
        if let Some(&local) = self.queue_indices.get(&group) {
            return local;
        }
        let plan = self.plan;
        let hub = self.device_of(group);
        let mut members = Vec::new();
        for &member in &plan.groups[&group] {
            let member_device = self.device_of(member);
            let local = if member_device == hub {
                self.queue_endpoint(member)
            } else if fan_in {
                self.tag_endpoint((member, group), member_device, hub)
            } else {
                self.tag_endpoint((group, member), hub, member_device)
            };
            members.push(local);
        }
        let local = self.push(QueueDesc::Group {
            name: format!("m{}.{}", self.model_id, plan.queues[group].name),
            members,
        });
        self.queue_indices.insert(group, local);
        local
    }

    fn add_binding(&mut self, src: usize, dst: usize) {
        let src_device = self.device_of(src);
        let dst_device = self.device_of(dst);
        let here = self.device;
        let plan = self.plan;

        match (plan.is_group(src), plan.is_group(dst)) {
            (false, false) => {
                if src_device == here && dst_device == here {
                    let s = self.queue_endpoint(src);
                    let d = self.queue_endpoint(dst);
                    self.bindings.push((s, d));
                } else if src_device == here {
                    let s = self.queue_endpoint(src);
                    let t = self.tag_endpoint((src, dst), src_device, dst_device);
                    self.bindings.push((s, t));
                } else if dst_device == here {
                    let t = self.tag_endpoint((src, dst), src_device, dst_device);
                    let d = self.queue_endpoint(dst);
                    self.bindings.push((t, d));
                }
            }
            (true, false) => {
                // fan-in: the group lives with its destination
                if dst_device == here {
                    let g = self.group_endpoint(src, true);
                    let d = self.queue_endpoint(dst);
                    self.bindings.push((g, d));
                } else {
                    for &member in &plan.groups[&src] {
                        if self.device_of(member) == here {
                            let m = self.queue_endpoint(member);
                            let t = self.tag_endpoint((member, src), here, dst_device);
                            self.bindings.push((m, t));
                        }
                    }
                }
            }
            (false, true) => {
                // fan-out: the group lives with its source
                if src_device == here {
                    let s = self.queue_endpoint(src);
                    let g = self.group_endpoint(dst, false);
                    self.bindings.push((s, g));
                } else {
                    for &member in &plan.groups[&dst] {
                        if self.device_of(member) == here {
                            let t = self.tag_endpoint((dst, member), src_device, here);
                            let m = self.queue_endpoint(member);
                            self.bindings.push((t, m));
                        }
                    }
                }
            }
            (true, true) => {}
        }
    }
}

/// Project `plan` onto `device`, naming owned queues after `model_id`
pub fn build_exchange_plan(
    plan: &DeployPlan,
    device: DeviceKey,
    model_id: u32,
    master_address: &str,
) -> Result<DeviceExchangePlan> {
    plan.validate()?;

    let local_address = plan
        .device_info(&device)
        .map(|d| d.address.clone())
        .unwrap_or_default();
    let mut builder = Builder {
        plan,
        device,
        model_id,
        queues: Vec::new(),
        queue_indices: HashMap::new(),
        tag_indices: HashMap::new(),
        bindings: Vec::new(),
    };

    for (index, info) in plan.queues.iter().enumerate() {
        if info.device == device && !plan.is_group(index) {
            builder.queue_endpoint(index);
        }
    }
    for &(src, dst) in &plan.bindings {
        builder.add_binding(src, dst);
    }

    Ok(DeviceExchangePlan {
        plan: ExchangePlan {
            device,
            queues: builder.queues,
            bindings: builder.bindings,
            master_address: master_address.to_string(),
            local_address,
        },
        queue_indices: builder.queue_indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::fixtures::*;

    #[test]
    fn test_local_projection_has_tag_for_cross_device_edge() {
        let plan = two_node_plan();
        let local = build_exchange_plan(&plan, DeviceKey::local(0), 7, "10.0.0.1:9100").unwrap();

        // root_in, head_in, root_out plus one tag for 0->1
        assert_eq!(local.plan.queues.len(), 4);
        let tags: Vec<_> = local
            .plan
            .queues
            .iter()
            .filter(|q| matches!(q, QueueDesc::Tag { .. }))
            .collect();
        assert_eq!(tags.len(), 1);
        match tags[0] {
            QueueDesc::Tag { edge, dst, .. } => {
                assert_eq!(*edge, (0, 1));
                assert_eq!(*dst, DeviceKey::new(1, 0));
            }
            _ => unreachable!(),
        }
        assert_eq!(local.plan.bindings.len(), 2);
        assert_eq!(local.plan.master_address, "10.0.0.1:9100");

        match &local.plan.queues[local.local_index(0).unwrap()] {
            QueueDesc::LocalQueue { name, .. } => assert_eq!(name, "m7.root_in"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_remote_projection_receives_through_tag() {
        let plan = two_node_plan();
        let remote = build_exchange_plan(&plan, DeviceKey::new(1, 0), 7, "").unwrap();

        // body_in, body_out plus the receiving tag
        assert_eq!(remote.plan.queues.len(), 3);
        let body_in = remote.local_index(1).unwrap();
        assert_eq!(remote.plan.bindings.len(), 1);
        let (src, dst) = remote.plan.bindings[0];
        assert_eq!(dst, body_in);
        assert!(matches!(remote.plan.queues[src], QueueDesc::Tag { .. }));
        assert!(remote.local_index(0).is_err());
    }

    #[test]
    fn test_fan_out_group_spans_devices() {
        let local = DeviceKey::local(0);
        let remote_a = DeviceKey::new(1, 0);
        let remote_b = DeviceKey::new(2, 0);
        let plan = DeployPlan {
            devices: vec![device(local), device(remote_a), device(remote_b)],
            queues: vec![
                queue("src", local),
                queue("a_in", remote_a),
                queue("b_in", remote_b),
                queue("fanout", local),
            ],
            bindings: vec![(0, 3)],
            groups: [(3, vec![1, 2])].into_iter().collect(),
            ..Default::default()
        };

        let hub = build_exchange_plan(&plan, local, 1, "").unwrap();
        let group = hub.local_index(3).unwrap();
        match &hub.plan.queues[group] {
            QueueDesc::Group { members, .. } => {
                assert_eq!(members.len(), 2);
                for m in members {
                    assert!(matches!(hub.plan.queues[*m], QueueDesc::Tag { .. }));
                }
            }
            other => panic!("unexpected {:?}", other),
        }

        let leaf = build_exchange_plan(&plan, remote_b, 1, "").unwrap();
        assert_eq!(leaf.plan.bindings.len(), 1);
        match &leaf.plan.queues[leaf.plan.bindings[0].0] {
            QueueDesc::Tag { edge, src, .. } => {
                assert_eq!(*edge, (3, 2));
                assert_eq!(*src, local);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_external_queue_keeps_name() {
        let mut plan = two_node_plan();
        plan.queues[3].owned_locally = false;
        let local = build_exchange_plan(&plan, DeviceKey::local(0), 2, "").unwrap();
        let index = local.local_index(3).unwrap();
        assert_eq!(
            local.plan.queues[index],
            QueueDesc::ExternalQueue {
                name: "head_in".into()
            }
        );
    }
}
