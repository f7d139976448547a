//! Resolved data-exchange routes
//!
//! An [`ExchangeRoute`] is what an [`ExchangePlan`](crate::plan::ExchangePlan)
//! becomes once its queues, tags and groups exist on a device and every
//! binding has been issued against an [`ExchangeService`].

pub mod resolver;
pub mod service;

use crate::comm::{CommHandle, TagId};
use crate::error::{DeployError, Result};
use crate::plan::DeviceId;
use crate::transport::{QueueId, WorkMode};
use std::collections::BTreeMap;

pub use resolver::ExchangeRouteResolver;
pub use service::{QueueExchangeService, ResourceCounts};

pub type GroupId = u32;

/// Native endpoint representation understood by an [`ExchangeService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NativeEndpoint {
    Queue(QueueId),
    Tag { handle: CommHandle, tag: TagId },
    Group(GroupId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Queue,
    Tag,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEndpoint {
    pub handle: CommHandle,
    pub tag: TagId,
    pub local_address: String,
    pub peer_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeEndpoint {
    pub kind: EndpointKind,
    /// Unset for single-member groups, which bind as their member
    pub native: Option<NativeEndpoint>,
    /// Queues created by this route are destroyed with it; resolved ones are not
    pub owned: bool,
    pub tag: Option<TagEndpoint>,
    pub members: Vec<usize>,
}

impl ExchangeEndpoint {
    pub(crate) fn queue(id: QueueId, owned: bool) -> Self {
        Self {
            kind: EndpointKind::Queue,
            native: Some(NativeEndpoint::Queue(id)),
            owned,
            tag: None,
            members: Vec::new(),
        }
    }

    pub(crate) fn tag(tag: TagEndpoint) -> Self {
        Self {
            kind: EndpointKind::Tag,
            native: Some(NativeEndpoint::Tag {
                handle: tag.handle,
                tag: tag.tag,
            }),
            owned: true,
            tag: Some(tag),
            members: Vec::new(),
        }
    }

    pub(crate) fn group(id: Option<GroupId>, members: Vec<usize>) -> Self {
        Self {
            kind: EndpointKind::Group,
            native: id.map(NativeEndpoint::Group),
            owned: true,
            tag: None,
            members,
        }
    }
}

/// A binding issued against the exchange service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundRoute {
    pub src: NativeEndpoint,
    pub dst: NativeEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRoute {
    device: DeviceId,
    endpoints: BTreeMap<usize, ExchangeEndpoint>,
    bound: Vec<BoundRoute>,
}

impl ExchangeRoute {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            endpoints: BTreeMap::new(),
            bound: Vec::new(),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn endpoint(&self, index: usize) -> Option<&ExchangeEndpoint> {
        self.endpoints.get(&index)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (usize, &ExchangeEndpoint)> {
        self.endpoints.iter().map(|(i, e)| (*i, e))
    }

    pub fn bound_routes(&self) -> &[BoundRoute] {
        &self.bound
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty() && self.bound.is_empty()
    }

    pub(crate) fn insert(&mut self, index: usize, endpoint: ExchangeEndpoint) {
        self.endpoints.insert(index, endpoint);
    }

    pub(crate) fn record_binding(&mut self, src: NativeEndpoint, dst: NativeEndpoint) {
        self.bound.push(BoundRoute { src, dst });
    }

    /// Queue id at `index`; any other endpoint kind is an error
    pub fn queue_id(&self, index: usize) -> Result<QueueId> {
        let endpoint = self.endpoints.get(&index).ok_or_else(|| {
            DeployError::InvalidParam(format!(
                "endpoint {} not resolved on device {}",
                index, self.device
            ))
        })?;
        match endpoint.native {
            Some(NativeEndpoint::Queue(id)) => Ok(id),
            _ => Err(DeployError::InvalidParam(format!(
                "endpoint {} on device {} is a {:?}, not a queue",
                index, self.device, endpoint.kind
            ))),
        }
    }

    pub fn queue_ids(&self, indices: &[usize]) -> Result<Vec<QueueId>> {
        indices.iter().map(|i| self.queue_id(*i)).collect()
    }
}

/// Native endpoint operations on one host
pub trait ExchangeService: Send + Sync {
    fn create_queue(&self, device: DeviceId, name: &str, depth: u32, mode: WorkMode)
        -> Result<QueueId>;
    fn find_queue(&self, device: DeviceId, name: &str) -> Result<QueueId>;
    fn destroy_queue(&self, device: DeviceId, queue: QueueId) -> Result<()>;
    fn create_group(&self, device: DeviceId, members: &[NativeEndpoint]) -> Result<GroupId>;
    fn destroy_group(&self, device: DeviceId, group: GroupId) -> Result<()>;
    fn bind(&self, device: DeviceId, src: NativeEndpoint, dst: NativeEndpoint) -> Result<()>;
    fn unbind(&self, device: DeviceId, src: NativeEndpoint, dst: NativeEndpoint) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_lookup_is_type_checked() {
        let mut route = ExchangeRoute::new(0);
        route.insert(0, ExchangeEndpoint::queue(5, true));
        route.insert(1, ExchangeEndpoint::group(Some(2), vec![0]));

        assert_eq!(route.queue_id(0).unwrap(), 5);
        assert!(matches!(
            route.queue_id(1),
            Err(DeployError::InvalidParam(_))
        ));
        assert!(route.queue_id(9).is_err());
        assert_eq!(route.queue_ids(&[0, 0]).unwrap(), vec![5, 5]);
    }
}
