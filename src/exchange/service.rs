//! Exchange service backed by the queue transport
//!
//! Queues are real transport queues. Groups and bindings are tracked here so
//! teardown can be audited through [`QueueExchangeService::resource_counts`].
//!
//! This service only keeps accounts: a binding records the route and moves no
//! data. Forwarding between bound endpoints belongs to the device runtime.

use super::{ExchangeService, GroupId, NativeEndpoint};
use crate::error::{lock_poisoned, DeployError, Result};
use crate::plan::DeviceId;
use crate::transport::{QueueId, QueueTransport, WorkMode};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Live resources created through the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub queues: usize,
    pub groups: usize,
    pub bindings: usize,
}

#[derive(Default)]
struct ServiceState {
    next_group: GroupId,
    queues: HashSet<(DeviceId, QueueId)>,
    /// Queues resolved by name; bindable but not owned
    known_queues: HashSet<(DeviceId, QueueId)>,
    groups: HashMap<(DeviceId, GroupId), Vec<NativeEndpoint>>,
    bindings: HashSet<(DeviceId, NativeEndpoint, NativeEndpoint)>,
}

impl ServiceState {
    fn check_endpoint(&self, device: DeviceId, endpoint: NativeEndpoint) -> Result<()> {
        let known = match endpoint {
            NativeEndpoint::Queue(q) => {
                self.queues.contains(&(device, q)) || self.known_queues.contains(&(device, q))
            }
            NativeEndpoint::Group(g) => self.groups.contains_key(&(device, g)),
            NativeEndpoint::Tag { .. } => true,
        };
        if known {
            Ok(())
        } else {
            Err(DeployError::NotFound(format!(
                "endpoint {:?} on device {}",
                endpoint, device
            )))
        }
    }
}

pub struct QueueExchangeService {
    transport: Arc<QueueTransport>,
    state: Mutex<ServiceState>,
}

impl QueueExchangeService {
    pub fn new(transport: Arc<QueueTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(ServiceState::default()),
        }
    }

    pub fn transport(&self) -> &Arc<QueueTransport> {
        &self.transport
    }

    pub fn resource_counts(&self) -> ResourceCounts {
        self.state
            .lock()
            .map(|s| ResourceCounts {
                queues: s.queues.len(),
                groups: s.groups.len(),
                bindings: s.bindings.len(),
            })
            .unwrap_or_default()
    }
}

impl ExchangeService for QueueExchangeService {
    fn create_queue(
        &self,
        device: DeviceId,
        name: &str,
        depth: u32,
        mode: WorkMode,
    ) -> Result<QueueId> {
        let queue = self.transport.create_queue(device, name, depth, mode)?;
        self.state
            .lock()
            .map_err(lock_poisoned("exchange service"))?
            .queues
            .insert((device, queue));
        Ok(queue)
    }

    fn find_queue(&self, device: DeviceId, name: &str) -> Result<QueueId> {
        let queue = self.transport.find_queue(device, name)?;
        self.state
            .lock()
            .map_err(lock_poisoned("exchange service"))?
            .known_queues
            .insert((device, queue));
        Ok(queue)
    }

    fn destroy_queue(&self, device: DeviceId, queue: QueueId) -> Result<()> {
        {
            let mut state = self.state.lock().map_err(lock_poisoned("exchange service"))?;
            if !state.queues.remove(&(device, queue)) {
                return Err(DeployError::NotFound(format!(
                    "queue {} on device {} was not created here",
                    queue, device
                )));
            }
        }
        self.transport.destroy_queue(device, queue)
    }

    fn create_group(&self, device: DeviceId, members: &[NativeEndpoint]) -> Result<GroupId> {
        if members.is_empty() {
            return Err(DeployError::InvalidParam("group has no members".into()));
        }
        let mut state = self.state.lock().map_err(lock_poisoned("exchange service"))?;
        for member in members {
            if matches!(member, NativeEndpoint::Group(_)) {
                return Err(DeployError::InvalidParam(
                    "groups cannot contain groups".into(),
                ));
            }
            state.check_endpoint(device, *member)?;
        }
        state.next_group += 1;
        let group = state.next_group;
        state.groups.insert((device, group), members.to_vec());
        debug!(device_id = device, group, members = members.len(), "Group created");
        Ok(group)
    }

    fn destroy_group(&self, device: DeviceId, group: GroupId) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_poisoned("exchange service"))?;
        state
            .groups
            .remove(&(device, group))
            .map(|_| ())
            .ok_or_else(|| DeployError::NotFound(format!("group {} on device {}", group, device)))
    }

    fn bind(&self, device: DeviceId, src: NativeEndpoint, dst: NativeEndpoint) -> Result<()> {
        if matches!((src, dst), (NativeEndpoint::Group(_), NativeEndpoint::Group(_))) {
            return Err(DeployError::Internal(
                "group endpoints cannot be bound to each other".into(),
            ));
        }
        let mut state = self.state.lock().map_err(lock_poisoned("exchange service"))?;
        state.check_endpoint(device, src)?;
        state.check_endpoint(device, dst)?;
        if !state.bindings.insert((device, src, dst)) {
            return Err(DeployError::InvalidParam(format!(
                "{:?} -> {:?} already bound on device {}",
                src, dst, device
            )));
        }
        Ok(())
    }

    fn unbind(&self, device: DeviceId, src: NativeEndpoint, dst: NativeEndpoint) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_poisoned("exchange service"))?;
        if state.bindings.remove(&(device, src, dst)) {
            Ok(())
        } else {
            Err(DeployError::NotFound(format!(
                "binding {:?} -> {:?} on device {}",
                src, dst, device
            )))
        }
    }
}
