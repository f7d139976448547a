//! Turns an [`ExchangePlan`] into a bound [`ExchangeRoute`] on one device
//!
//! Resolution runs in two phases. `pre_deploy` creates queues, then tags and
//! groups; `deploy` additionally binds every plan binding. The whole plan is
//! validated before anything is created, so a malformed plan never leaves
//! half a route behind.

use super::{ExchangeEndpoint, ExchangeRoute, ExchangeService, NativeEndpoint, TagEndpoint};
use crate::comm::{CommBackend, CommHandle};
use crate::error::{DeployError, Result};
use crate::plan::{DeviceId, DeviceKey, ExchangePlan, QueueDesc};
use crate::transport::WorkMode;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Empty,
    PreDeployed,
    Bound,
}

pub struct ExchangeRouteResolver {
    plan: ExchangePlan,
    device: DeviceId,
    service: Arc<dyn ExchangeService>,
    comm: Arc<dyn CommBackend>,
    route: ExchangeRoute,
    handles: HashMap<(DeviceKey, DeviceKey), CommHandle>,
    stage: Stage,
}

fn tag_name(src: DeviceKey, dst: DeviceKey, edge: (usize, usize)) -> String {
    format!("tag:{}->{}:{}_{}", src, dst, edge.0, edge.1)
}

impl ExchangeRouteResolver {
    pub fn new(
        plan: ExchangePlan,
        service: Arc<dyn ExchangeService>,
        comm: Arc<dyn CommBackend>,
    ) -> Self {
        let device = plan.device.device_id;
        Self {
            plan,
            device,
            service,
            comm,
            route: ExchangeRoute::new(device),
            handles: HashMap::new(),
            stage: Stage::Empty,
        }
    }

    pub fn plan(&self) -> &ExchangePlan {
        &self.plan
    }

    pub fn route(&self) -> &ExchangeRoute {
        &self.route
    }

    fn is_group(&self, index: usize) -> bool {
        matches!(self.plan.queues.get(index), Some(QueueDesc::Group { .. }))
    }

    fn validate(&self) -> Result<()> {
        let count = self.plan.queues.len();
        let in_range = |index: usize, what: &str| -> Result<()> {
            if index >= count {
                return Err(DeployError::InvalidParam(format!(
                    "{} references endpoint {} but the exchange plan for {} has {}",
                    what, index, self.plan.device, count
                )));
            }
            Ok(())
        };

        for &(src, dst) in &self.plan.bindings {
            in_range(src, "binding")?;
            in_range(dst, "binding")?;
            if self.is_group(src) && self.is_group(dst) {
                return Err(DeployError::Internal(format!(
                    "binding {} -> {} connects two groups",
                    src, dst
                )));
            }
        }
        for (index, desc) in self.plan.queues.iter().enumerate() {
            if let QueueDesc::Group { members, .. } = desc {
                if members.is_empty() {
                    return Err(DeployError::InvalidParam(format!(
                        "group {} has no members",
                        index
                    )));
                }
                for &member in members {
                    in_range(member, "group")?;
                    if self.is_group(member) {
                        return Err(DeployError::InvalidParam(format!(
                            "group {} contains group {}",
                            index, member
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Create every endpoint of the plan; calling it again is a no-op
    pub fn pre_deploy(&mut self) -> Result<()> {
        if self.stage != Stage::Empty {
            return Ok(());
        }
        self.validate()?;

        let result = self
            .create_endpoints()
            .and_then(|()| self.create_groups_and_tags());
        if let Err(e) = result {
            warn!(device_id = self.device, error = %e, "Pre-deploy failed, releasing partial route");
            self.rollback();
            return Err(e);
        }
        self.stage = Stage::PreDeployed;
        debug!(
            device_id = self.device,
            endpoints = self.plan.queues.len(),
            "Exchange route pre-deployed"
        );
        Ok(())
    }

    /// Pre-deploy if needed, then bind every plan binding
    pub fn deploy(&mut self) -> Result<&ExchangeRoute> {
        self.pre_deploy()?;
        if self.stage == Stage::PreDeployed {
            if let Err(e) = self.bind_endpoints() {
                warn!(device_id = self.device, error = %e, "Binding failed, releasing route");
                self.rollback();
                return Err(e);
            }
            self.stage = Stage::Bound;
        }
        Ok(&self.route)
    }

    /// Hand the resolved route to the caller, who becomes responsible for
    /// tearing it down
    pub fn take_route(&mut self) -> ExchangeRoute {
        self.handles.clear();
        self.stage = Stage::Empty;
        std::mem::replace(&mut self.route, ExchangeRoute::new(self.device))
    }

    fn create_endpoints(&mut self) -> Result<()> {
        let sources: HashSet<usize> = self.plan.bindings.iter().map(|b| b.0).collect();
        for (index, desc) in self.plan.queues.iter().enumerate() {
            let endpoint = match desc {
                QueueDesc::LocalQueue { name, depth } => {
                    let mode = if sources.contains(&index) {
                        WorkMode::Push
                    } else {
                        WorkMode::Pull
                    };
                    let id = self.service.create_queue(self.device, name, *depth, mode)?;
                    ExchangeEndpoint::queue(id, true)
                }
                QueueDesc::ExternalQueue { name } => {
                    let id = self.service.find_queue(self.device, name)?;
                    ExchangeEndpoint::queue(id, false)
                }
                QueueDesc::Tag { .. } | QueueDesc::Group { .. } => continue,
            };
            self.route.insert(index, endpoint);
        }
        Ok(())
    }

    fn create_groups_and_tags(&mut self) -> Result<()> {
        let bindings = self.plan.bindings.clone();
        for (src, dst) in bindings {
            for side in [src, dst] {
                if self.is_group(side) {
                    self.ensure_group(side)?;
                }
            }
        }
        for index in 0..self.plan.queues.len() {
            if matches!(self.plan.queues[index], QueueDesc::Tag { .. }) {
                self.ensure_tag(index)?;
            }
        }
        Ok(())
    }

    fn ensure_group(&mut self, index: usize) -> Result<()> {
        if self.route.endpoint(index).is_some() {
            return Ok(());
        }
        let members = match &self.plan.queues[index] {
            QueueDesc::Group { members, .. } => members.clone(),
            other => {
                return Err(DeployError::Internal(format!(
                    "endpoint {} is a {}, not a group",
                    index,
                    other.kind_name()
                )))
            }
        };
        let mut natives = Vec::with_capacity(members.len());
        for &member in &members {
            if self.route.endpoint(member).is_none() {
                self.ensure_tag(member)?;
            }
            natives.push(self.native(member)?);
        }
        let id = if members.len() > 1 {
            Some(self.service.create_group(self.device, &natives)?)
        } else {
            None
        };
        self.route.insert(index, ExchangeEndpoint::group(id, members));
        Ok(())
    }

    fn ensure_tag(&mut self, index: usize) -> Result<()> {
        if self.route.endpoint(index).is_some() {
            return Ok(());
        }
        let (src, dst, edge, peer_address) = match &self.plan.queues[index] {
            QueueDesc::Tag {
                src,
                dst,
                edge,
                peer_address,
            } => (*src, *dst, *edge, peer_address.clone()),
            other => {
                return Err(DeployError::Internal(format!(
                    "endpoint {} is an unresolved {}",
                    index,
                    other.kind_name()
                )))
            }
        };

        let handle = match self.handles.get(&(src, dst)) {
            Some(handle) => *handle,
            None => {
                let handle = self
                    .comm
                    .create_handle(&self.plan.local_address, &peer_address)?;
                self.handles.insert((src, dst), handle);
                handle
            }
        };
        let tag = self.comm.create_tag(handle, &tag_name(src, dst, edge))?;
        self.route.insert(
            index,
            ExchangeEndpoint::tag(TagEndpoint {
                handle,
                tag,
                local_address: self.plan.local_address.clone(),
                peer_address,
            }),
        );
        Ok(())
    }

    /// Native endpoint for `index`, collapsing single-member groups
    fn native(&self, index: usize) -> Result<NativeEndpoint> {
        let endpoint = self.route.endpoint(index).ok_or_else(|| {
            DeployError::Internal(format!(
                "endpoint {} unresolved on device {}",
                index, self.device
            ))
        })?;
        match (endpoint.native, endpoint.members.as_slice()) {
            (Some(native), _) => Ok(native),
            (None, [only]) => self.native(*only),
            (None, _) => Err(DeployError::Internal(format!(
                "endpoint {} has no native representation",
                index
            ))),
        }
    }

    fn bind_endpoints(&mut self) -> Result<()> {
        let bindings = self.plan.bindings.clone();
        for (src, dst) in bindings {
            if self.is_group(src) && self.is_group(dst) {
                return Err(DeployError::Internal(format!(
                    "binding {} -> {} connects two groups",
                    src, dst
                )));
            }
            let src_native = self.native(src)?;
            let dst_native = self.native(dst)?;
            self.service.bind(self.device, src_native, dst_native)?;
            self.route.record_binding(src_native, dst_native);
        }
        debug!(
            device_id = self.device,
            bindings = self.route.bound_routes().len(),
            "Exchange route bound"
        );
        Ok(())
    }

    fn rollback(&mut self) {
        let route = std::mem::replace(&mut self.route, ExchangeRoute::new(self.device));
        let used: HashSet<CommHandle> = route
            .endpoints()
            .filter_map(|(_, e)| e.tag.as_ref().map(|t| t.handle))
            .collect();
        Self::undeploy(self.service.as_ref(), self.comm.as_ref(), &route);
        for (_, handle) in self.handles.drain() {
            if !used.contains(&handle) {
                if let Err(e) = self.comm.release_handle(handle) {
                    warn!(handle, error = %e, "Failed to release comm handle");
                }
            }
        }
        self.stage = Stage::Empty;
    }

    /// Tear down `route`; keeps going past individual failures and returns
    /// how many there were
    pub fn undeploy(
        service: &dyn ExchangeService,
        comm: &dyn CommBackend,
        route: &ExchangeRoute,
    ) -> usize {
        let device = route.device();
        let mut failures = 0;
        let mut note = |what: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!(device_id = device, error = %e, "Failed to {}", what);
                failures += 1;
            }
        };

        for bound in route.bound_routes() {
            note("unbind route", service.unbind(device, bound.src, bound.dst));
        }
        for (_, endpoint) in route.endpoints() {
            if let (Some(NativeEndpoint::Queue(queue)), true) = (endpoint.native, endpoint.owned) {
                note("destroy queue", service.destroy_queue(device, queue));
            }
        }
        let mut handles = BTreeSet::new();
        for (_, endpoint) in route.endpoints() {
            if let Some(tag) = &endpoint.tag {
                handles.insert(tag.handle);
                note("destroy tag", comm.destroy_tag(tag.handle, tag.tag));
            }
        }
        for (_, endpoint) in route.endpoints() {
            if let Some(NativeEndpoint::Group(group)) = endpoint.native {
                note("destroy group", service.destroy_group(device, group));
            }
        }
        for handle in handles {
            note("release comm handle", comm.release_handle(handle));
        }

        debug!(device_id = device, failures, "Exchange route torn down");
        failures
    }
}

impl Drop for ExchangeRouteResolver {
    fn drop(&mut self) {
        if !self.route.is_empty() || !self.handles.is_empty() {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{CommCounts, LoopbackComm};
    use crate::config::TransportConfig;
    use crate::exchange::{QueueExchangeService, ResourceCounts};
    use crate::plan::build_exchange_plan;
    use crate::plan::fixtures::two_node_plan;
    use crate::transport::QueueTransport;

    struct Harness {
        service: Arc<QueueExchangeService>,
        comm: Arc<LoopbackComm>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                service: Arc::new(QueueExchangeService::new(Arc::new(
                    QueueTransport::in_memory(TransportConfig::default()),
                ))),
                comm: Arc::new(LoopbackComm::new()),
            }
        }

        fn resolver(&self, plan: ExchangePlan) -> ExchangeRouteResolver {
            ExchangeRouteResolver::new(plan, self.service.clone(), self.comm.clone())
        }

        fn assert_clean(&self) {
            assert_eq!(self.service.resource_counts(), ResourceCounts::default());
            assert_eq!(self.comm.counts(), CommCounts::default());
        }
    }

    fn local(name: &str) -> QueueDesc {
        QueueDesc::LocalQueue {
            name: name.to_string(),
            depth: 2,
        }
    }

    fn tag(edge: (usize, usize)) -> QueueDesc {
        QueueDesc::Tag {
            src: DeviceKey::local(0),
            dst: DeviceKey::new(1, 0),
            edge,
            peer_address: "10.0.0.2:9000".into(),
        }
    }

    fn plan(queues: Vec<QueueDesc>, bindings: Vec<(usize, usize)>) -> ExchangePlan {
        ExchangePlan {
            device: DeviceKey::local(0),
            queues,
            bindings,
            master_address: "10.0.0.1:9100".into(),
            local_address: "10.0.0.1:9000".into(),
        }
    }

    #[test]
    fn test_deploy_then_undeploy_leaves_nothing() {
        let h = Harness::new();
        let exchange = build_exchange_plan(&two_node_plan(), DeviceKey::local(0), 1, "m").unwrap();
        let mut resolver = h.resolver(exchange.plan);
        resolver.deploy().unwrap();
        let route = resolver.take_route();

        assert_eq!(route.bound_routes().len(), 2);
        assert_eq!(h.comm.counts(), CommCounts { handles: 1, tags: 1 });
        assert_eq!(h.service.resource_counts().queues, 3);

        assert_eq!(ExchangeRouteResolver::undeploy(h.service.as_ref(), h.comm.as_ref(), &route), 0);
        h.assert_clean();
    }

    #[test]
    fn test_pre_deploy_is_idempotent() {
        let h = Harness::new();
        let mut resolver = h.resolver(plan(vec![local("a"), local("b")], vec![(0, 1)]));
        resolver.pre_deploy().unwrap();
        resolver.pre_deploy().unwrap();
        assert_eq!(h.service.resource_counts().queues, 2);
        assert_eq!(h.service.resource_counts().bindings, 0);

        resolver.deploy().unwrap();
        resolver.deploy().unwrap();
        assert_eq!(h.service.resource_counts().bindings, 1);
    }

    #[test]
    fn test_out_of_range_binding_creates_nothing() {
        let h = Harness::new();
        let queues = (0..6).map(|i| local(&format!("q{}", i))).collect();
        let mut resolver = h.resolver(plan(queues, vec![(0, 1), (2, 99)]));
        let err = resolver.deploy().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PARAM_INVALID);
        assert!(resolver.route().bound_routes().is_empty());
        h.assert_clean();
    }

    #[test]
    fn test_group_to_group_never_partially_binds() {
        let h = Harness::new();
        let queues = vec![
            local("a"),
            local("b"),
            QueueDesc::Group {
                name: "g1".into(),
                members: vec![0],
            },
            QueueDesc::Group {
                name: "g2".into(),
                members: vec![1],
            },
        ];
        for bindings in [vec![(2, 3)], vec![(0, 1), (2, 3)]] {
            let mut resolver = h.resolver(plan(queues.clone(), bindings));
            let err = resolver.deploy().unwrap_err();
            assert!(matches!(err, DeployError::Internal(_)));
            h.assert_clean();
        }
    }

    #[test]
    fn test_single_member_group_binds_as_member() {
        let h = Harness::new();
        let queues = vec![
            local("a"),
            local("b"),
            QueueDesc::Group {
                name: "g".into(),
                members: vec![1],
            },
        ];
        let mut resolver = h.resolver(plan(queues, vec![(0, 2)]));
        let route = resolver.deploy().unwrap();
        let b = route.queue_id(1).unwrap();
        assert_eq!(route.bound_routes()[0].dst, NativeEndpoint::Queue(b));
        assert_eq!(h.service.resource_counts().groups, 0);
    }

    #[test]
    fn test_fan_in_group_over_tags_shares_handle() {
        let h = Harness::new();
        let queues = vec![
            local("dst"),
            tag((5, 9)),
            tag((6, 9)),
            QueueDesc::Group {
                name: "fanin".into(),
                members: vec![1, 2],
            },
        ];
        let mut resolver = h.resolver(plan(queues, vec![(3, 0)]));
        resolver.deploy().unwrap();
        assert_eq!(h.comm.counts(), CommCounts { handles: 1, tags: 2 });
        assert_eq!(h.service.resource_counts().groups, 1);
        assert!(resolver.route().queue_id(3).is_err());

        let route = resolver.take_route();
        ExchangeRouteResolver::undeploy(h.service.as_ref(), h.comm.as_ref(), &route);
        h.assert_clean();
    }

    #[test]
    fn test_missing_external_queue_rolls_back() {
        let h = Harness::new();
        let queues = vec![
            local("a"),
            QueueDesc::ExternalQueue {
                name: "absent".into(),
            },
        ];
        let mut resolver = h.resolver(plan(queues, vec![(0, 1)]));
        assert!(resolver.pre_deploy().is_err());
        h.assert_clean();
    }

    #[test]
    fn test_external_queue_survives_teardown() {
        let h = Harness::new();
        let external = h
            .service
            .transport()
            .create_queue(0, "shared", 4, WorkMode::Pull)
            .unwrap();
        let queues = vec![
            local("a"),
            QueueDesc::ExternalQueue {
                name: "shared".into(),
            },
        ];
        let mut resolver = h.resolver(plan(queues, vec![(0, 1)]));
        resolver.deploy().unwrap();
        assert_eq!(resolver.route().queue_id(1).unwrap(), external);

        drop(resolver);
        h.assert_clean();
        assert_eq!(h.service.transport().find_queue(0, "shared").unwrap(), external);
    }
}
