//! Loading submodels placed on the orchestrator node

use crate::error::Result;
use crate::executor::{ExecutorManager, WorkerRequest};
use crate::plan::DeviceId;
use crate::transport::QueueId;
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::{debug, warn};

/// A local submodel with its queues already resolved
#[derive(Debug, Clone)]
pub struct LocalSubmodel {
    pub sub_model_id: u32,
    pub name: String,
    pub device: DeviceId,
    pub data: Vec<u8>,
    pub input_queue_ids: Vec<QueueId>,
    pub output_queue_ids: Vec<QueueId>,
}

pub trait LocalModelLoader: Send + Sync {
    fn load(&self, model_id: u32, submodel: &LocalSubmodel) -> Result<()>;

    /// Release everything loaded for `model_id`; never fails
    fn unload(&self, model_id: u32);
}

/// Loads local submodels into executor workers owned by the orchestrator
pub struct ExecutorLoader {
    executor: ExecutorManager,
    loaded: Mutex<BTreeSet<(u32, DeviceId)>>,
}

impl ExecutorLoader {
    pub fn new(executor: ExecutorManager) -> Self {
        Self {
            executor,
            loaded: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn executor(&self) -> &ExecutorManager {
        &self.executor
    }
}

impl LocalModelLoader for ExecutorLoader {
    fn load(&self, model_id: u32, submodel: &LocalSubmodel) -> Result<()> {
        let request = WorkerRequest::LoadModel {
            root_model_id: model_id,
            sub_model_id: submodel.sub_model_id,
            name: submodel.name.clone(),
            model: submodel.data.clone(),
            input_queue_ids: submodel.input_queue_ids.clone(),
            output_queue_ids: submodel.output_queue_ids.clone(),
        };
        self.executor
            .send_request(submodel.device, &request)?
            .into_result()?;
        if let Ok(mut loaded) = self.loaded.lock() {
            loaded.insert((model_id, submodel.device));
        }
        debug!(model_id, name = %submodel.name, device_id = submodel.device, "Local submodel loaded");
        Ok(())
    }

    fn unload(&self, model_id: u32) {
        let devices: Vec<DeviceId> = match self.loaded.lock() {
            Ok(mut loaded) => {
                let hit: Vec<_> = loaded.iter().filter(|(m, _)| *m == model_id).copied().collect();
                for key in &hit {
                    loaded.remove(key);
                }
                hit.into_iter().map(|(_, d)| d).collect()
            }
            Err(_) => return,
        };
        for device in devices {
            let request = WorkerRequest::UnloadModel {
                root_model_id: model_id,
                sub_model_id: None,
            };
            let outcome = self
                .executor
                .send_request(device, &request)
                .and_then(|r| r.into_result());
            if let Err(e) = outcome {
                warn!(model_id, device_id = device, error = %e, "Local unload failed");
            }
        }
    }
}
