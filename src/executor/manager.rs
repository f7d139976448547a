//! Executor process table
//!
//! One worker per (context, device), created on first use. The table lock is
//! held across creation so two callers never fork the same worker twice.

use super::launcher::WorkerLauncher;
use super::worker::ProcessWorker;
use super::{WorkerHandle, WorkerRequest, WorkerResponse, WorkerSpec};
use crate::config::ExecutorConfig;
use crate::error::{lock_poisoned, Result};
use crate::plan::DeviceId;
use crate::transport::{QueueId, QueueTransport, WorkMode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct ExecutorProcess {
    pub device_id: DeviceId,
    pub pid: Option<i32>,
    pub queue_id: QueueId,
    pub mem_group: String,
    worker: Box<dyn WorkerHandle>,
}

impl ExecutorProcess {
    pub fn send_request(&mut self, request: &WorkerRequest) -> Result<WorkerResponse> {
        let payload = bincode::serialize(request)?;
        let reply = self.worker.send_request(&payload)?;
        Ok(bincode::deserialize(&reply)?)
    }
}

type ProcessKey = (u64, DeviceId);

pub struct ExecutorManager {
    context_id: u64,
    transport: Arc<QueueTransport>,
    launcher: Arc<dyn WorkerLauncher>,
    config: ExecutorConfig,
    processes: Mutex<HashMap<ProcessKey, Arc<Mutex<ExecutorProcess>>>>,
}

impl ExecutorManager {
    pub fn new(
        context_id: u64,
        transport: Arc<QueueTransport>,
        launcher: Arc<dyn WorkerLauncher>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            context_id,
            transport,
            launcher,
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Worker for `device`, forking and handshaking it on first use
    pub fn get_or_fork(&self, device: DeviceId) -> Result<Arc<Mutex<ExecutorProcess>>> {
        let mut processes = self.processes.lock().map_err(lock_poisoned("executor table"))?;
        let key = (self.context_id, device);
        if let Some(process) = processes.get(&key) {
            return Ok(Arc::clone(process));
        }

        let queue_name = format!("executor.{}.{}", self.context_id, device);
        let queue_id =
            self.transport
                .create_queue(device, &queue_name, self.config.queue_depth, WorkMode::Pull)?;
        let mem_group = format!("mem_group_{}_{}", self.context_id, device);
        let spec = WorkerSpec {
            device_id: device,
            queue_id,
            mem_group: mem_group.clone(),
        };

        let mut worker = ProcessWorker::new(spec, Arc::clone(&self.launcher), self.config.clone());
        if let Err(e) = worker.start() {
            warn!(device_id = device, error = %e, "Executor worker failed to start");
            if let Err(destroy) = self.transport.destroy_queue(device, queue_id) {
                warn!(device_id = device, error = %destroy, "Failed to destroy executor queue");
            }
            return Err(e);
        }

        let process = Arc::new(Mutex::new(ExecutorProcess {
            device_id: device,
            pid: worker.pid(),
            queue_id,
            mem_group,
            worker: Box::new(worker),
        }));
        processes.insert(key, Arc::clone(&process));
        info!(context_id = self.context_id, device_id = device, queue_id, "Executor process registered");
        Ok(process)
    }

    /// Send one request; a worker that failed the exchange is dropped from the
    /// table and the next request forks a fresh one
    pub fn send_request(&self, device: DeviceId, request: &WorkerRequest) -> Result<WorkerResponse> {
        let process = self.get_or_fork(device)?;
        let (result, alive) = {
            let mut guard = process.lock().map_err(lock_poisoned("executor process"))?;
            let result = guard.send_request(request);
            (result, guard.worker.is_running())
        };
        if !alive {
            self.retire(device, process);
        }
        result
    }

    fn retire(&self, device: DeviceId, process: Arc<Mutex<ExecutorProcess>>) {
        if let Ok(mut processes) = self.processes.lock() {
            let key = (self.context_id, device);
            if processes.get(&key).map_or(false, |p| Arc::ptr_eq(p, &process)) {
                processes.remove(&key);
            }
        }
        warn!(context_id = self.context_id, device_id = device, "Executor process retired");
        self.finalize_process(process);
    }

    pub fn has_process(&self, device: DeviceId) -> bool {
        self.processes
            .lock()
            .map(|p| p.contains_key(&(self.context_id, device)))
            .unwrap_or(false)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .processes
            .lock()
            .map(|p| p.keys().map(|(_, d)| *d).collect())
            .unwrap_or_default();
        devices.sort_unstable();
        devices
    }

    fn finalize_process(&self, process: Arc<Mutex<ExecutorProcess>>) {
        let mut process = match process.lock() {
            Ok(process) => process,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = process.worker.stop() {
            warn!(device_id = process.device_id, error = %e, "Executor worker did not stop cleanly");
        }
        if let Err(e) = self.transport.destroy_queue(process.device_id, process.queue_id) {
            warn!(device_id = process.device_id, error = %e, "Failed to destroy executor queue");
        }
        debug!(device_id = process.device_id, "Executor process finalized");
    }

    /// Stop every worker and destroy its queue
    pub fn finalize(&self) {
        let drained: Vec<_> = match self.processes.lock() {
            Ok(mut processes) => processes.drain().map(|(_, p)| p).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, p)| p).collect(),
        };
        for process in drained {
            self.finalize_process(process);
        }
    }
}

impl Drop for ExecutorManager {
    fn drop(&mut self) {
        self.finalize();
    }
}
