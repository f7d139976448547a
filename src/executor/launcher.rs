//! Starting worker runtimes
//!
//! [`ForkLauncher`] forks a child process per worker; [`ThreadLauncher`] runs
//! the same runtime on a thread for single-process deployments and tests.

use super::{runtime, WorkerSpec};
use crate::error::{DeployError, Result};
use nix::unistd::{fork, ForkResult, Pid};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use tracing::debug;

pub enum WorkerChild {
    Process(Pid),
    Thread(JoinHandle<i32>),
}

/// Parent ends of a freshly started worker's channels
pub struct LaunchedWorker {
    pub data: UnixStream,
    pub events: UnixStream,
    pub child: WorkerChild,
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec) -> Result<LaunchedWorker>;
}

pub struct ForkLauncher;

impl WorkerLauncher for ForkLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<LaunchedWorker> {
        let (data, worker_data) = UnixStream::pair()?;
        let (events, worker_events) = UnixStream::pair()?;

        // Only this thread survives in the child, and locks other threads held
        // at the fork stay held there. The child must stay inside the worker
        // runtime and exit without returning to the caller.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(worker_data);
                drop(worker_events);
                debug!(device_id = spec.device_id, pid = child.as_raw(), "Forked executor worker");
                Ok(LaunchedWorker {
                    data,
                    events,
                    child: WorkerChild::Process(child),
                })
            }
            Ok(ForkResult::Child) => {
                drop(data);
                drop(events);
                let code = runtime::run_worker(spec.clone(), worker_data, worker_events);
                std::process::exit(code);
            }
            Err(e) => Err(DeployError::Process(format!(
                "failed to fork worker for device {}: {}",
                spec.device_id, e
            ))),
        }
    }
}

pub struct ThreadLauncher;

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<LaunchedWorker> {
        let (data, worker_data) = UnixStream::pair()?;
        let (events, worker_events) = UnixStream::pair()?;
        let worker_spec = spec.clone();
        let handle = thread::Builder::new()
            .name(format!("executor-{}", spec.device_id))
            .spawn(move || runtime::run_worker(worker_spec, worker_data, worker_events))
            .map_err(|e| {
                DeployError::Process(format!(
                    "failed to spawn worker thread for device {}: {}",
                    spec.device_id, e
                ))
            })?;
        Ok(LaunchedWorker {
            data,
            events,
            child: WorkerChild::Thread(handle),
        })
    }
}
