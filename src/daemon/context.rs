//! Per-client deployment state on a device
//!
//! A context owns the executor workers it forked, the routes it resolved and
//! the submodel bytes it received. Closing it releases all of them.

use super::DaemonServices;
use crate::config::MaintenanceConfig;
use crate::error::{DeployError, Result};
use crate::exchange::{ExchangeRouteResolver, ExchangeService};
use crate::executor::{ExecutorManager, WorkerRequest};
use crate::plan::exchange::ExchangePlan;
use crate::plan::DeviceId;
use crate::protocol::{ClientId, RequestBody, ResponseBody, SubmodelDesc};
use crate::registry::RouteId;
use crate::transport::QueueId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub device: DeviceId,
    pub root_model_id: u32,
    pub sub_model_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmodelQueues {
    pub inputs: Vec<QueueId>,
    pub outputs: Vec<QueueId>,
    pub control_inputs: Vec<QueueId>,
    pub control_outputs: Vec<QueueId>,
}

struct DeployedSubmodel {
    desc: SubmodelDesc,
    queues: SubmodelQueues,
    loaded: bool,
}

struct ModelTransfer {
    total: u64,
    data: Vec<u8>,
}

impl ModelTransfer {
    fn is_complete(&self) -> bool {
        self.data.len() as u64 == self.total
    }
}

pub struct DeployContext {
    client_id: ClientId,
    services: Arc<DaemonServices>,
    executor: ExecutorManager,
    submodels: HashMap<ModelKey, DeployedSubmodel>,
    transfers: HashMap<ModelKey, ModelTransfer>,
    routes: HashMap<(DeviceId, u32), RouteId>,
    var_managers: HashMap<DeviceId, (u64, Vec<u8>)>,
    maintenance: Option<MaintenanceConfig>,
    configured: HashSet<DeviceId>,
}

impl DeployContext {
    pub fn new(client_id: ClientId, services: Arc<DaemonServices>) -> Self {
        let executor = ExecutorManager::new(
            client_id,
            Arc::clone(&services.transport),
            Arc::clone(&services.launcher),
            services.executor_config.clone(),
        );
        Self {
            client_id,
            services,
            executor,
            submodels: HashMap::new(),
            transfers: HashMap::new(),
            routes: HashMap::new(),
            var_managers: HashMap::new(),
            maintenance: None,
            configured: HashSet::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn executor(&self) -> &ExecutorManager {
        &self.executor
    }

    pub fn route_id(&self, device: DeviceId, root_model_id: u32) -> Option<RouteId> {
        self.routes.get(&(device, root_model_id)).copied()
    }

    pub fn submodel_queues(&self, key: &ModelKey) -> Option<&SubmodelQueues> {
        self.submodels.get(key).map(|s| &s.queues)
    }

    pub fn is_loaded(&self, key: &ModelKey) -> bool {
        self.submodels.get(key).map_or(false, |s| s.loaded)
    }

    /// Handle one deployment request for `device`. Session requests (`Init`,
    /// `Heartbeat`, `Disconnect`) belong to the session manager.
    pub fn process(&mut self, device: DeviceId, body: RequestBody) -> Result<ResponseBody> {
        match body {
            RequestBody::PreDeployModel {
                root_model_id,
                exchange_plan,
                submodels,
            } => self.pre_deploy_model(device, root_model_id, exchange_plan, submodels),
            RequestBody::DownloadDeviceConfig(config) => self.download_device_config(config),
            RequestBody::PreDownloadModel {
                root_model_id,
                sub_model_id,
                total_size,
            } => self.pre_download_model(
                ModelKey {
                    device,
                    root_model_id,
                    sub_model_id,
                },
                total_size,
            ),
            RequestBody::DownloadModel {
                root_model_id,
                sub_model_id,
                offset,
                data,
            } => self.download_model(
                ModelKey {
                    device,
                    root_model_id,
                    sub_model_id,
                },
                offset,
                data,
            ),
            RequestBody::LoadModel {
                root_model_id,
                sub_model_id,
            } => self.load_model(ModelKey {
                device,
                root_model_id,
                sub_model_id,
            }),
            RequestBody::UnloadModel { root_model_id } => self.unload_model(device, root_model_id),
            RequestBody::DownloadVarManager { session_id, data } => {
                self.var_managers.insert(device, (session_id, data));
                Ok(ResponseBody::None)
            }
            RequestBody::DownloadSharedContent { key, op } => {
                self.services.shared_content.apply(&key, op)
            }
            RequestBody::DeployRankTable { rank_table } => self.deploy_rank_table(&rank_table),
            other @ (RequestBody::Init { .. } | RequestBody::Heartbeat | RequestBody::Disconnect) => {
                Err(DeployError::Internal(format!(
                    "{} is a session request",
                    other.name()
                )))
            }
        }
    }

    fn pre_deploy_model(
        &mut self,
        device: DeviceId,
        root_model_id: u32,
        exchange_plan: ExchangePlan,
        submodels: Vec<SubmodelDesc>,
    ) -> Result<ResponseBody> {
        if self.routes.contains_key(&(device, root_model_id)) {
            return Err(DeployError::InvalidParam(format!(
                "model {} is already pre-deployed on device {}",
                root_model_id, device
            )));
        }
        if exchange_plan.device.device_id != device {
            return Err(DeployError::InvalidParam(format!(
                "exchange plan for {} sent to device {}",
                exchange_plan.device, device
            )));
        }

        let exchange: Arc<dyn ExchangeService> = self.services.exchange.clone();
        let mut resolver = ExchangeRouteResolver::new(
            exchange_plan,
            Arc::clone(&exchange),
            Arc::clone(&self.services.comm),
        );
        resolver.deploy()?;
        let route = resolver.take_route();

        let resolved: Result<Vec<(SubmodelDesc, SubmodelQueues)>> = submodels
            .into_iter()
            .map(|desc| {
                let queues = SubmodelQueues {
                    inputs: route.queue_ids(&desc.input_endpoints)?,
                    outputs: route.queue_ids(&desc.output_endpoints)?,
                    control_inputs: route.queue_ids(&desc.control_input_endpoints)?,
                    control_outputs: route.queue_ids(&desc.control_output_endpoints)?,
                };
                Ok((desc, queues))
            })
            .collect();
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                ExchangeRouteResolver::undeploy(exchange.as_ref(), self.services.comm.as_ref(), &route);
                return Err(e);
            }
        };

        let route_id = self.services.routes.add(route)?;
        self.routes.insert((device, root_model_id), route_id);
        for (desc, queues) in resolved {
            let key = ModelKey {
                device,
                root_model_id,
                sub_model_id: desc.sub_model_id,
            };
            self.submodels.insert(
                key,
                DeployedSubmodel {
                    desc,
                    queues,
                    loaded: false,
                },
            );
        }
        info!(
            client_id = self.client_id,
            device_id = device,
            root_model_id,
            route_id,
            "Model pre-deployed"
        );
        Ok(ResponseBody::None)
    }

    fn download_device_config(&mut self, config: MaintenanceConfig) -> Result<ResponseBody> {
        self.configured.clear();
        for device in self.executor.devices() {
            self.executor
                .send_request(device, &WorkerRequest::UpdateConfig(config.clone()))?
                .into_result()?;
            self.configured.insert(device);
        }
        self.maintenance = Some(config);
        Ok(ResponseBody::None)
    }

    fn pre_download_model(&mut self, key: ModelKey, total_size: u64) -> Result<ResponseBody> {
        if !self.submodels.contains_key(&key) {
            return Err(DeployError::InvalidParam(format!(
                "submodel {}/{} was not pre-deployed on device {}",
                key.root_model_id, key.sub_model_id, key.device
            )));
        }
        if total_size == 0 {
            return Err(DeployError::InvalidParam(format!(
                "submodel {}/{} has no content",
                key.root_model_id, key.sub_model_id
            )));
        }
        // the announced size is untrusted; storage grows per chunk
        self.transfers.insert(
            key,
            ModelTransfer {
                total: total_size,
                data: Vec::new(),
            },
        );
        Ok(ResponseBody::None)
    }

    fn download_model(&mut self, key: ModelKey, offset: u64, data: Vec<u8>) -> Result<ResponseBody> {
        let transfer = self.transfers.get_mut(&key).ok_or_else(|| {
            DeployError::InvalidParam(format!(
                "submodel {}/{} has no transfer in progress",
                key.root_model_id, key.sub_model_id
            ))
        })?;
        if offset != transfer.data.len() as u64 {
            return Err(DeployError::InvalidParam(format!(
                "chunk at offset {} but {} bytes received",
                offset,
                transfer.data.len()
            )));
        }
        if transfer.data.len() as u64 + data.len() as u64 > transfer.total {
            return Err(DeployError::InvalidParam(format!(
                "chunk overruns announced size {}",
                transfer.total
            )));
        }
        transfer
            .data
            .try_reserve(data.len())
            .map_err(|e| DeployError::InvalidParam(format!("submodel chunk rejected: {}", e)))?;
        transfer.data.extend_from_slice(&data);
        Ok(ResponseBody::None)
    }

    /// Push config and variable state to a worker before its first load
    fn prepare_worker(&mut self, device: DeviceId) -> Result<()> {
        if let Some(config) = &self.maintenance {
            if !self.configured.contains(&device) {
                self.executor
                    .send_request(device, &WorkerRequest::UpdateConfig(config.clone()))?
                    .into_result()?;
                self.configured.insert(device);
            }
        }
        if let Some((session_id, data)) = self.var_managers.remove(&device) {
            self.executor
                .send_request(device, &WorkerRequest::SyncVarManager { session_id, data })?
                .into_result()?;
        }
        Ok(())
    }

    fn load_model(&mut self, key: ModelKey) -> Result<ResponseBody> {
        let submodel = self.submodels.get(&key).ok_or_else(|| {
            DeployError::InvalidParam(format!(
                "submodel {}/{} was not pre-deployed on device {}",
                key.root_model_id, key.sub_model_id, key.device
            ))
        })?;
        if submodel.loaded {
            return Ok(ResponseBody::None);
        }
        match self.transfers.get(&key) {
            Some(transfer) if transfer.is_complete() => {}
            Some(transfer) => {
                return Err(DeployError::InvalidParam(format!(
                    "submodel {} has {} of {} bytes",
                    submodel.desc.name,
                    transfer.data.len(),
                    transfer.total
                )))
            }
            None => {
                return Err(DeployError::InvalidParam(format!(
                    "submodel {} was never downloaded",
                    submodel.desc.name
                )))
            }
        }
        if let Some(missing) = submodel
            .desc
            .file_constants
            .iter()
            .find(|k| !self.services.shared_content.is_ready(k))
        {
            return Err(DeployError::InvalidParam(format!(
                "submodel {} needs shared content {} which is not complete",
                submodel.desc.name, missing
            )));
        }

        self.prepare_worker(key.device)?;

        let (name, queues) = match self.submodels.get(&key) {
            Some(s) => (s.desc.name.clone(), s.queues.clone()),
            None => return Err(DeployError::Internal("submodel vanished during load".into())),
        };
        let model = self
            .transfers
            .remove(&key)
            .map(|t| t.data)
            .unwrap_or_default();
        let request = WorkerRequest::LoadModel {
            root_model_id: key.root_model_id,
            sub_model_id: key.sub_model_id,
            name: name.clone(),
            model,
            input_queue_ids: queues.inputs,
            output_queue_ids: queues.outputs,
        };
        self.executor.send_request(key.device, &request)?.into_result()?;
        if let Some(submodel) = self.submodels.get_mut(&key) {
            submodel.loaded = true;
        }
        info!(client_id = self.client_id, device_id = key.device, name = %name, "Submodel loaded");
        Ok(ResponseBody::None)
    }

    /// Release everything held for `root_model_id` on `device`. Unknown
    /// models succeed.
    fn unload_model(&mut self, device: DeviceId, root_model_id: u32) -> Result<ResponseBody> {
        let any_loaded = self
            .submodels
            .iter()
            .any(|(k, s)| k.device == device && k.root_model_id == root_model_id && s.loaded);
        if any_loaded && self.executor.has_process(device) {
            let request = WorkerRequest::UnloadModel {
                root_model_id,
                sub_model_id: None,
            };
            let outcome = self
                .executor
                .send_request(device, &request)
                .and_then(|r| r.into_result());
            if let Err(e) = outcome {
                warn!(device_id = device, root_model_id, error = %e, "Worker unload failed");
            }
        }

        self.submodels
            .retain(|k, _| !(k.device == device && k.root_model_id == root_model_id));
        self.transfers
            .retain(|k, _| !(k.device == device && k.root_model_id == root_model_id));

        if let Some(route_id) = self.routes.remove(&(device, root_model_id)) {
            match self.services.routes.remove(route_id) {
                Ok(route) => {
                    let failures = ExchangeRouteResolver::undeploy(
                        self.services.exchange.as_ref(),
                        self.services.comm.as_ref(),
                        &route,
                    );
                    if failures > 0 {
                        warn!(route_id, failures, "Route teardown was incomplete");
                    }
                }
                Err(e) => warn!(route_id, error = %e, "Route already gone"),
            }
        }
        debug!(client_id = self.client_id, device_id = device, root_model_id, "Model unloaded");
        Ok(ResponseBody::None)
    }

    fn deploy_rank_table(&self, rank_table: &str) -> Result<ResponseBody> {
        let comm = &self.services.comm;
        if comm.supports_rank_table() {
            comm.init_rank_table(rank_table)?;
            debug!(backend = comm.name(), "Rank table initialized");
        } else {
            debug!(backend = comm.name(), "Backend has no rank table, skipping");
        }
        Ok(ResponseBody::None)
    }

    /// Unload every model and stop every worker
    pub fn close(&mut self) {
        let mut models: Vec<(DeviceId, u32)> = self.routes.keys().copied().collect();
        models.extend(self.submodels.keys().map(|k| (k.device, k.root_model_id)));
        models.sort_unstable();
        models.dedup();
        for (device, root_model_id) in models {
            // unload never fails
            let _ = self.unload_model(device, root_model_id);
        }
        self.transfers.clear();
        self.var_managers.clear();
        self.executor.finalize();
        debug!(client_id = self.client_id, "Deploy context closed");
    }
}

impl Drop for DeployContext {
    fn drop(&mut self) {
        self.close();
    }
}
