//! Multi-device model rollout
//!
//! Order of a deployment:
//! 1. pre-deploy the exchange routes of every orchestrator-local device
//! 2. rank table, device config and shared weights to every remote device
//! 3. `PreDeployModel` to every remote device, one after another
//! 4. transfer and load on all remote devices at once, one thread each
//! 5. bind the local routes and load the local submodels
//!
//! Any failure tears down everything reached so far before it is returned.

use super::deployer::Deployer;
use super::loader::{LocalModelLoader, LocalSubmodel};
use super::planner::{ModelArtifact, Planner, SubmodelArtifact};
use super::weights::{transfer_file_constant, transfer_submodel};
use crate::comm::CommBackend;
use crate::config::MaintenanceConfig;
use crate::error::{lock_poisoned, DeployError, Result};
use crate::exchange::{ExchangeRoute, ExchangeRouteResolver, ExchangeService};
use crate::plan::exchange::{build_exchange_plan, DeviceExchangePlan};
use crate::plan::{DeployPlan, DeviceInfo, DeviceKey, DeviceType, SubmodelInfo};
use crate::protocol::{RequestBody, SubmodelDesc};
use crate::registry::{RouteId, RouteRegistry};
use crate::transport::QueueId;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Data-plane address remote devices reach the orchestrator on
    pub master_address: String,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub model_id: u32,
    pub route_ids: Vec<RouteId>,
    pub input_queue_ids: Vec<QueueId>,
    pub output_queue_ids: Vec<QueueId>,
    pub control_input_queue_ids: Vec<QueueId>,
    pub control_output_queue_ids: Vec<QueueId>,
}

struct DeployedModel {
    route_ids: Vec<RouteId>,
    remote_devices: Vec<DeviceKey>,
    has_local: bool,
}

/// A submodel with its plan entry, artifact and assigned id
struct Placed<'p> {
    sub_model_id: u32,
    name: &'p str,
    info: &'p SubmodelInfo,
    artifact: &'p SubmodelArtifact,
}

/// Plan split by locality, checked before anything is created
struct Partition<'p> {
    local: BTreeMap<DeviceKey, Vec<Placed<'p>>>,
    remote: BTreeMap<DeviceKey, Vec<Placed<'p>>>,
}

pub struct DeploymentOrchestrator {
    planner: Arc<dyn Planner>,
    devices: Vec<DeviceInfo>,
    deployers: HashMap<DeviceKey, Arc<dyn Deployer>>,
    exchange: Arc<dyn ExchangeService>,
    comm: Arc<dyn CommBackend>,
    routes: Arc<RouteRegistry>,
    loader: Arc<dyn LocalModelLoader>,
    config: OrchestratorConfig,
    next_model_id: Mutex<u32>,
    deployed: Mutex<HashMap<u32, DeployedModel>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        planner: Arc<dyn Planner>,
        exchange: Arc<dyn ExchangeService>,
        comm: Arc<dyn CommBackend>,
        routes: Arc<RouteRegistry>,
        loader: Arc<dyn LocalModelLoader>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            planner,
            devices: Vec::new(),
            deployers: HashMap::new(),
            exchange,
            comm,
            routes,
            loader,
            config,
            next_model_id: Mutex::new(0),
            deployed: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_device(&mut self, device: DeviceInfo) {
        self.devices.push(device);
    }

    /// Register the client for a remote device; it is also offered to the
    /// planner unless already listed
    pub fn add_deployer(&mut self, deployer: Arc<dyn Deployer>, address: impl Into<String>) {
        let key = deployer.device();
        if !self.devices.iter().any(|d| d.key == key) {
            self.devices.push(DeviceInfo {
                key,
                device_type: DeviceType::Npu,
                address: address.into(),
            });
        }
        self.deployers.insert(key, deployer);
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn query_route(&self, route_id: RouteId) -> Result<Arc<ExchangeRoute>> {
        self.routes.query(route_id)
    }

    pub fn deployed_models(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .deployed
            .lock()
            .map(|d| d.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    fn allocate_model_id(&self) -> Result<u32> {
        let mut next = self.next_model_id.lock().map_err(lock_poisoned("model id"))?;
        let id = *next;
        *next = id
            .checked_add(1)
            .ok_or_else(|| DeployError::Internal("model id space exhausted".into()))?;
        Ok(id)
    }

    #[cfg(test)]
    pub(crate) fn set_next_model_id(&self, id: u32) {
        if let Ok(mut next) = self.next_model_id.lock() {
            *next = id;
        }
    }

    fn available_devices(&self) -> Vec<DeviceInfo> {
        if self.devices.is_empty() {
            vec![DeviceInfo::host_pseudo_device(self.config.master_address.clone())]
        } else {
            self.devices.clone()
        }
    }

    fn partition<'p>(&self, model: &'p ModelArtifact, plan: &'p DeployPlan) -> Result<Partition<'p>> {
        let mut local: BTreeMap<DeviceKey, Vec<Placed<'p>>> = BTreeMap::new();
        let mut remote: BTreeMap<DeviceKey, Vec<Placed<'p>>> = BTreeMap::new();

        for queue in &plan.queues {
            if queue.device.is_local() {
                local.entry(queue.device).or_default();
            } else {
                remote.entry(queue.device).or_default();
            }
        }
        for (index, (name, info)) in plan.submodels.iter().enumerate() {
            let artifact = model.submodels.get(&info.model).ok_or_else(|| {
                DeployError::InvalidParam(format!(
                    "submodel {} refers to {} which model {} does not contain",
                    name, info.model, model.name
                ))
            })?;
            let placed = Placed {
                sub_model_id: u32::try_from(index)
                    .map_err(|_| DeployError::InvalidParam("too many submodels".into()))?,
                name,
                info,
                artifact,
            };
            let side = if info.device.is_local() {
                &mut local
            } else {
                &mut remote
            };
            side.entry(info.device).or_default().push(placed);
        }

        if let Some(missing) = remote.keys().find(|k| !self.deployers.contains_key(k)) {
            return Err(DeployError::InvalidParam(format!(
                "no daemon connection for device {}",
                missing
            )));
        }
        for &index in plan
            .input_queue_indices
            .iter()
            .chain(&plan.output_queue_indices)
            .chain(&plan.control_input_queue_indices)
            .chain(&plan.control_output_queue_indices)
        {
            if !plan.queues[index].device.is_local() {
                return Err(DeployError::InvalidParam(format!(
                    "model root queue {} is placed on remote device {}",
                    plan.queues[index].name, plan.queues[index].device
                )));
            }
        }
        Ok(Partition { local, remote })
    }

    /// Deploy `model` onto every device its plan names
    pub fn deploy_model(&self, model: &ModelArtifact) -> Result<DeployResult> {
        let model_id = self.allocate_model_id()?;
        let devices = self.available_devices();
        let plan = self.planner.plan(model, &devices)?;
        plan.validate()?;
        let partition = self.partition(model, &plan)?;
        info!(
            model_id,
            model = %model.name,
            local_devices = partition.local.len(),
            remote_devices = partition.remote.len(),
            "Deploying model"
        );

        let mut rollout = Rollout {
            orchestrator: self,
            model_id,
            plan: &plan,
            local_plans: BTreeMap::new(),
            resolvers: BTreeMap::new(),
            local_routes: BTreeMap::new(),
            reached: BTreeSet::new(),
            local_loaded: false,
        };
        match rollout.run(&partition) {
            Ok(result) => {
                let record = DeployedModel {
                    route_ids: result.route_ids.clone(),
                    remote_devices: rollout.reached.iter().copied().collect(),
                    has_local: rollout.local_loaded,
                };
                self.deployed
                    .lock()
                    .map_err(lock_poisoned("deployed models"))?
                    .insert(model_id, record);
                info!(model_id, routes = ?result.route_ids, "Model deployed");
                Ok(result)
            }
            Err(e) => {
                warn!(model_id, error = %e, "Deployment failed, rolling back");
                rollout.rollback();
                Err(e)
            }
        }
    }

    /// Tear down a deployed model on every device it reached
    pub fn undeploy(&self, model_id: u32) -> Result<()> {
        let record = self
            .deployed
            .lock()
            .map_err(lock_poisoned("deployed models"))?
            .remove(&model_id)
            .ok_or_else(|| DeployError::InvalidParam(format!("model {} is not deployed", model_id)))?;
        self.unload_remote(model_id, &record.remote_devices);
        if record.has_local {
            self.loader.unload(model_id);
        }
        self.release_routes(&record.route_ids);
        info!(model_id, "Model undeployed");
        Ok(())
    }

    fn unload_remote(&self, model_id: u32, devices: &[DeviceKey]) {
        for device in devices {
            let Some(deployer) = self.deployers.get(device) else { continue };
            if let Err(e) = deployer.process(RequestBody::UnloadModel {
                root_model_id: model_id,
            }) {
                warn!(model_id, device = %device, error = %e, "Remote unload failed");
            }
        }
    }

    fn release_routes(&self, route_ids: &[RouteId]) {
        for &route_id in route_ids {
            match self.routes.remove(route_id) {
                Ok(route) => {
                    let failures =
                        ExchangeRouteResolver::undeploy(self.exchange.as_ref(), self.comm.as_ref(), &route);
                    if failures > 0 {
                        warn!(route_id, failures, "Route teardown was incomplete");
                    }
                }
                Err(e) => warn!(route_id, error = %e, "Route already released"),
            }
        }
    }
}

/// State of one in-progress deployment, kept for rollback
struct Rollout<'o, 'p> {
    orchestrator: &'o DeploymentOrchestrator,
    model_id: u32,
    plan: &'p DeployPlan,
    local_plans: BTreeMap<DeviceKey, DeviceExchangePlan>,
    /// Pre-deployed but not yet bound; dropping one releases its endpoints
    resolvers: BTreeMap<DeviceKey, ExchangeRouteResolver>,
    local_routes: BTreeMap<DeviceKey, RouteId>,
    reached: BTreeSet<DeviceKey>,
    local_loaded: bool,
}

impl<'o, 'p> Rollout<'o, 'p> {
    fn deployer(&self, device: &DeviceKey) -> Result<&'o Arc<dyn Deployer>> {
        self.orchestrator
            .deployers
            .get(device)
            .ok_or_else(|| DeployError::InvalidParam(format!("no daemon connection for {}", device)))
    }

    fn exchange_plan(&self, device: DeviceKey) -> Result<DeviceExchangePlan> {
        build_exchange_plan(
            self.plan,
            device,
            self.model_id,
            &self.orchestrator.config.master_address,
        )
    }

    fn run(&mut self, partition: &Partition<'_>) -> Result<DeployResult> {
        self.pre_deploy_local(partition)?;
        self.deploy_rank_table(partition)?;
        self.download_device_config(partition)?;
        self.download_weights(partition)?;
        self.pre_deploy_remote(partition)?;
        self.load_remote(partition)?;
        self.deploy_local(partition)
    }

    fn pre_deploy_local(&mut self, partition: &Partition<'_>) -> Result<()> {
        for &device in partition.local.keys() {
            let device_plan = self.exchange_plan(device)?;
            let mut resolver = ExchangeRouteResolver::new(
                device_plan.plan.clone(),
                Arc::clone(&self.orchestrator.exchange),
                Arc::clone(&self.orchestrator.comm),
            );
            resolver.pre_deploy()?;
            self.local_plans.insert(device, device_plan);
            self.resolvers.insert(device, resolver);
        }
        Ok(())
    }

    fn deploy_rank_table(&mut self, partition: &Partition<'_>) -> Result<()> {
        let comm = &self.orchestrator.comm;
        if !comm.supports_rank_table() {
            debug!(backend = comm.name(), "Backend has no rank table, skipping");
            return Ok(());
        }
        let rank_table = serde_json::to_string(&self.plan.devices)?;
        if let Err(e) = comm.init_rank_table(&rank_table) {
            warn!(error = %e, "Local rank table rejected");
        }
        for device in partition.remote.keys() {
            let deployer = self.deployer(device)?;
            self.reached.insert(*device);
            deployer.process(RequestBody::DeployRankTable {
                rank_table: rank_table.clone(),
            })?;
        }
        Ok(())
    }

    fn download_device_config(&mut self, partition: &Partition<'_>) -> Result<()> {
        for device in partition.remote.keys() {
            let deployer = self.deployer(device)?;
            self.reached.insert(*device);
            deployer.process(RequestBody::DownloadDeviceConfig(
                self.orchestrator.config.maintenance.clone(),
            ))?;
        }
        Ok(())
    }

    fn download_weights(&mut self, partition: &Partition<'_>) -> Result<()> {
        let mut sent: HashSet<(DeviceKey, &str)> = HashSet::new();
        for (device, placed) in &partition.remote {
            let deployer = self.deployer(device)?;
            for submodel in placed {
                for constant in &submodel.artifact.file_constants {
                    if sent.insert((*device, constant.name.as_str())) {
                        transfer_file_constant(deployer.as_ref(), constant)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn pre_deploy_remote(&mut self, partition: &Partition<'_>) -> Result<()> {
        for (device, placed) in &partition.remote {
            let device_plan = self.exchange_plan(*device)?;
            let submodels = placed
                .iter()
                .map(|p| {
                    Ok(SubmodelDesc {
                        sub_model_id: p.sub_model_id,
                        name: p.name.to_string(),
                        input_endpoints: device_plan.local_indices(&p.info.input_queue_indices)?,
                        output_endpoints: device_plan.local_indices(&p.info.output_queue_indices)?,
                        control_input_endpoints: device_plan
                            .local_indices(&p.info.control_input_queue_indices)?,
                        control_output_endpoints: device_plan
                            .local_indices(&p.info.control_output_queue_indices)?,
                        file_constants: p
                            .artifact
                            .file_constants
                            .iter()
                            .map(|c| c.name.clone())
                            .collect(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let deployer = self.deployer(device)?;
            self.reached.insert(*device);
            deployer.process(RequestBody::PreDeployModel {
                root_model_id: self.model_id,
                exchange_plan: device_plan.plan,
                submodels,
            })?;
            debug!(model_id = self.model_id, device = %device, "Remote pre-deploy done");
        }
        Ok(())
    }

    /// Transfer and load every remote group concurrently; every group runs to
    /// completion even when another fails
    fn load_remote(&mut self, partition: &Partition<'_>) -> Result<()> {
        let model_id = self.model_id;
        let mut groups = Vec::with_capacity(partition.remote.len());
        for (device, placed) in &partition.remote {
            groups.push((*device, self.deployer(device)?, placed));
        }

        let outcomes: Vec<(DeviceKey, Result<()>)> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|(device, deployer, placed)| {
                    let handle = scope.spawn(move || -> Result<()> {
                        for submodel in placed.iter() {
                            transfer_submodel(
                                deployer.as_ref(),
                                model_id,
                                submodel.sub_model_id,
                                &submodel.artifact.data,
                            )?;
                            deployer.process(RequestBody::LoadModel {
                                root_model_id: model_id,
                                sub_model_id: submodel.sub_model_id,
                            })?;
                        }
                        Ok(())
                    });
                    (*device, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(device, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        Err(DeployError::Internal(format!("load task for {} panicked", device)))
                    });
                    (device, outcome)
                })
                .collect()
        });

        let failed: Vec<String> = outcomes
            .iter()
            .filter_map(|(device, outcome)| {
                outcome.as_ref().err().map(|e| format!("{}: {}", device, e))
            })
            .collect();
        if !failed.is_empty() {
            return Err(DeployError::PartialDeployment(format!(
                "{} of {} remote devices failed to load: {}",
                failed.len(),
                outcomes.len(),
                failed.join("; ")
            )));
        }
        debug!(model_id, devices = outcomes.len(), "Remote load done");
        Ok(())
    }

    fn deploy_local(&mut self, partition: &Partition<'_>) -> Result<DeployResult> {
        let devices: Vec<DeviceKey> = self.resolvers.keys().copied().collect();
        for device in devices {
            let Some(mut resolver) = self.resolvers.remove(&device) else { continue };
            resolver.deploy()?;
            let route = resolver.take_route();
            match self.orchestrator.routes.add(route.clone()) {
                Ok(route_id) => {
                    self.local_routes.insert(device, route_id);
                }
                Err(e) => {
                    ExchangeRouteResolver::undeploy(
                        self.orchestrator.exchange.as_ref(),
                        self.orchestrator.comm.as_ref(),
                        &route,
                    );
                    return Err(e);
                }
            }
        }

        for (device, placed) in &partition.local {
            for submodel in placed {
                let route = self.local_route(device)?;
                let device_plan = self.local_plan(device)?;
                let local = LocalSubmodel {
                    sub_model_id: submodel.sub_model_id,
                    name: submodel.name.to_string(),
                    device: device.device_id,
                    data: submodel.artifact.data.clone(),
                    input_queue_ids: route
                        .queue_ids(&device_plan.local_indices(&submodel.info.input_queue_indices)?)?,
                    output_queue_ids: route
                        .queue_ids(&device_plan.local_indices(&submodel.info.output_queue_indices)?)?,
                };
                self.local_loaded = true;
                self.orchestrator.loader.load(self.model_id, &local)?;
            }
        }

        Ok(DeployResult {
            model_id: self.model_id,
            route_ids: self.local_routes.values().copied().collect(),
            input_queue_ids: self.root_queue_ids(&self.plan.input_queue_indices)?,
            output_queue_ids: self.root_queue_ids(&self.plan.output_queue_indices)?,
            control_input_queue_ids: self.root_queue_ids(&self.plan.control_input_queue_indices)?,
            control_output_queue_ids: self.root_queue_ids(&self.plan.control_output_queue_indices)?,
        })
    }

    fn local_route(&self, device: &DeviceKey) -> Result<Arc<ExchangeRoute>> {
        let route_id = self.local_routes.get(device).ok_or_else(|| {
            DeployError::Internal(format!("device {} has no bound route", device))
        })?;
        self.orchestrator.routes.query(*route_id)
    }

    fn local_plan(&self, device: &DeviceKey) -> Result<&DeviceExchangePlan> {
        self.local_plans
            .get(device)
            .ok_or_else(|| DeployError::Internal(format!("device {} has no exchange plan", device)))
    }

    fn root_queue_ids(&self, indices: &[usize]) -> Result<Vec<QueueId>> {
        indices
            .iter()
            .map(|&index| {
                let device = self.plan.queues[index].device;
                let route = self.local_route(&device)?;
                route.queue_id(self.local_plan(&device)?.local_index(index)?)
            })
            .collect()
    }

    fn rollback(&mut self) {
        let reached: Vec<DeviceKey> = self.reached.iter().copied().collect();
        self.orchestrator.unload_remote(self.model_id, &reached);
        if self.local_loaded {
            self.orchestrator.loader.unload(self.model_id);
        }
        let route_ids: Vec<RouteId> = self.local_routes.values().copied().collect();
        self.orchestrator.release_routes(&route_ids);
        self.local_routes.clear();
        // unbound resolvers release their endpoints on drop
        self.resolvers.clear();
    }
}
