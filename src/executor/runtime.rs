//! Worker-side request loop
//!
//! Runs inside the forked child (or worker thread). Sends the `Init` event,
//! then serves one request per `Pending` event until `Finalize` or until the
//! parent closes the event channel.

use super::{CompletionEvent, EventKind, WorkerRequest, WorkerResponse, WorkerSpec, INIT_SUB_TYPE};
use crate::config::MaintenanceConfig;
use crate::error::{DeployError, Result};
use crate::protocol::{read_frame, write_frame};
use crate::transport::QueueId;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::net::UnixStream;
use tracing::{debug, warn};

struct LoadedModel {
    name: String,
    size: usize,
    input_queue_ids: Vec<QueueId>,
    output_queue_ids: Vec<QueueId>,
}

struct WorkerRuntime {
    spec: WorkerSpec,
    models: BTreeMap<(u32, u32), LoadedModel>,
    var_managers: HashMap<u64, Vec<u8>>,
    config: MaintenanceConfig,
}

impl WorkerRuntime {
    fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            models: BTreeMap::new(),
            var_managers: HashMap::new(),
            config: MaintenanceConfig::default(),
        }
    }

    fn loaded(&self) -> u32 {
        self.models.len() as u32
    }

    fn handle(&mut self, request: WorkerRequest) -> Result<()> {
        match request {
            WorkerRequest::LoadModel {
                root_model_id,
                sub_model_id,
                name,
                model,
                input_queue_ids,
                output_queue_ids,
            } => {
                if model.is_empty() {
                    return Err(DeployError::InvalidParam(format!(
                        "submodel {} has no content",
                        name
                    )));
                }
                let key = (root_model_id, sub_model_id);
                if self.models.contains_key(&key) {
                    return Err(DeployError::InvalidParam(format!(
                        "submodel {}/{} already loaded on device {}",
                        root_model_id, sub_model_id, self.spec.device_id
                    )));
                }
                debug!(
                    device_id = self.spec.device_id,
                    root_model_id,
                    sub_model_id,
                    name = %name,
                    size = model.len(),
                    inputs = input_queue_ids.len(),
                    outputs = output_queue_ids.len(),
                    "Submodel loaded"
                );
                self.models.insert(
                    key,
                    LoadedModel {
                        name,
                        size: model.len(),
                        input_queue_ids,
                        output_queue_ids,
                    },
                );
                Ok(())
            }
            WorkerRequest::UnloadModel {
                root_model_id,
                sub_model_id,
            } => {
                self.models.retain(|(root, sub), model| {
                    let hit = *root == root_model_id && sub_model_id.map_or(true, |s| s == *sub);
                    if hit {
                        debug!(
                            device_id = self.spec.device_id,
                            name = %model.name,
                            size = model.size,
                            queues = model.input_queue_ids.len() + model.output_queue_ids.len(),
                            "Submodel unloaded"
                        );
                    }
                    !hit
                });
                Ok(())
            }
            WorkerRequest::SyncVarManager { session_id, data } => {
                self.var_managers.insert(session_id, data);
                Ok(())
            }
            WorkerRequest::UpdateConfig(config) => {
                self.config = config;
                debug!(
                    device_id = self.spec.device_id,
                    log_level = %self.config.log_level,
                    "Worker config updated"
                );
                Ok(())
            }
            WorkerRequest::Finalize => {
                self.models.clear();
                self.var_managers.clear();
                Ok(())
            }
        }
    }
}

fn serve_one(
    runtime: &mut WorkerRuntime,
    data: &mut UnixStream,
    events: &mut UnixStream,
    event: CompletionEvent,
) -> io::Result<bool> {
    let (message_id, payload) = read_frame(data)?;
    if message_id != event.sub_type {
        warn!(
            expected = event.sub_type,
            got = message_id,
            "Request frame does not match pending event"
        );
    }

    let (response, finalize) = match bincode::deserialize::<WorkerRequest>(&payload) {
        Ok(request) => {
            let finalize = matches!(request, WorkerRequest::Finalize);
            let response = match runtime.handle(request) {
                Ok(()) => WorkerResponse::ok(runtime.loaded()),
                Err(e) => WorkerResponse::error(&e, runtime.loaded()),
            };
            (response, finalize)
        }
        Err(e) => (
            WorkerResponse::error(&DeployError::from(e), runtime.loaded()),
            false,
        ),
    };

    let reply = bincode::serialize(&response)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(data, message_id, &reply)?;
    CompletionEvent::new(EventKind::Complete, message_id, response.error_code.0).write_to(events)?;
    Ok(finalize)
}

/// Serve requests until finalized; returns the exit code
pub fn run_worker(spec: WorkerSpec, mut data: UnixStream, mut events: UnixStream) -> i32 {
    let device_id = spec.device_id;
    let mut runtime = WorkerRuntime::new(spec);

    if let Err(e) = CompletionEvent::new(EventKind::Init, INIT_SUB_TYPE, 0).write_to(&mut events) {
        warn!(device_id, error = %e, "Worker failed to announce itself");
        return 1;
    }

    loop {
        let event = match CompletionEvent::read_from(&mut events) {
            Ok(event) => event,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return 0,
            Err(e) => {
                warn!(device_id, error = %e, "Worker event channel failed");
                return 1;
            }
        };
        if event.kind != EventKind::Pending {
            warn!(device_id, kind = ?event.kind, "Ignoring unexpected event");
            continue;
        }
        match serve_one(&mut runtime, &mut data, &mut events, event) {
            Ok(true) => return 0,
            Ok(false) => {}
            Err(e) => {
                warn!(device_id, error = %e, "Worker request failed");
                return 1;
            }
        }
    }
}
