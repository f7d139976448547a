//! Parent-side handle to one executor worker

use super::launcher::{LaunchedWorker, WorkerChild, WorkerLauncher};
use super::{CompletionEvent, EventKind, WorkerHandle, WorkerRequest, WorkerSpec, INIT_SUB_TYPE};
use crate::config::ExecutorConfig;
use crate::error::{DeployError, Result};
use crate::protocol::{read_frame, write_frame, MessageId};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Outcome of waiting on the event channel
enum Waited {
    Event(CompletionEvent),
    TimedOut,
}

/// Poll `events` every `interval`, at most `retries + 1` times
fn poll_event(events: &mut UnixStream, interval: Duration, retries: u32) -> Result<Waited> {
    events.set_read_timeout(Some(interval))?;
    for attempt in 0..=retries {
        match CompletionEvent::read_from(events) {
            Ok(event) => return Ok(Waited::Event(event)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                trace!(attempt, "No worker event yet");
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(DeployError::Process(
                    "worker closed its event channel".into(),
                ))
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Waited::TimedOut)
}

/// Require an event of `kind` with `sub_type`; anything else is not retried
fn expect_event(event: CompletionEvent, kind: EventKind, sub_type: u32) -> Result<u32> {
    if event.kind != kind || event.sub_type != sub_type {
        return Err(DeployError::Process(format!(
            "expected {:?} event with sub type {}, got {:?} with sub type {}",
            kind, sub_type, event.kind, event.sub_type
        )));
    }
    Ok(event.status)
}

pub struct ProcessWorker {
    spec: WorkerSpec,
    launcher: Arc<dyn WorkerLauncher>,
    config: ExecutorConfig,
    running: Option<LaunchedWorker>,
    next_message_id: MessageId,
}

impl ProcessWorker {
    pub fn new(spec: WorkerSpec, launcher: Arc<dyn WorkerLauncher>, config: ExecutorConfig) -> Self {
        Self {
            spec,
            launcher,
            config,
            running: None,
            next_message_id: 0,
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    fn next_id(&mut self) -> MessageId {
        // zero is the handshake sub type
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        self.next_message_id
    }

    /// One request round trip. A failed exchange may leave a late reply on
    /// the channels, so the worker is terminated and must be started afresh.
    fn exchange(&mut self, payload: &[u8], retries: u32) -> Result<Vec<u8>> {
        let result = self.round_trip(payload, retries);
        if let Err(e) = &result {
            if let Some(running) = self.running.take() {
                warn!(device_id = self.spec.device_id, error = %e, "Worker out of step, terminating it");
                Self::reap(running, true);
            }
        }
        result
    }

    fn round_trip(&mut self, payload: &[u8], retries: u32) -> Result<Vec<u8>> {
        let message_id = self.next_id();
        let interval = self.config.event_poll_interval;
        let device_id = self.spec.device_id;
        let running = self.running.as_mut().ok_or_else(|| {
            DeployError::Process(format!("worker for device {} is not running", device_id))
        })?;

        write_frame(&mut running.data, message_id, payload)?;
        CompletionEvent::new(EventKind::Pending, message_id, 0).write_to(&mut running.events)?;

        let event = match poll_event(&mut running.events, interval, retries)? {
            Waited::Event(event) => event,
            Waited::TimedOut => {
                return Err(DeployError::Timeout(format!(
                    "worker for device {} did not complete request {} after {} polls",
                    device_id,
                    message_id,
                    retries + 1
                )))
            }
        };
        let status = expect_event(event, EventKind::Complete, message_id)?;

        let (reply_id, reply) = read_frame(&mut running.data)?;
        if reply_id != message_id {
            return Err(DeployError::Process(format!(
                "worker replied to {} while {} was pending",
                reply_id, message_id
            )));
        }
        trace!(device_id, message_id, status, "Worker request completed");
        Ok(reply)
    }

    /// Kill (if asked) and reap the worker
    fn reap(running: LaunchedWorker, terminate: bool) {
        let LaunchedWorker {
            data,
            events,
            child,
        } = running;
        // closing our ends lets a thread worker see EOF
        drop(data);
        drop(events);
        match child {
            WorkerChild::Process(pid) => {
                if terminate {
                    if let Err(e) = kill(pid, Signal::SIGTERM) {
                        warn!(pid = pid.as_raw(), error = %e, "Failed to signal worker");
                    }
                }
                if let Err(e) = waitpid(pid, None) {
                    warn!(pid = pid.as_raw(), error = %e, "Failed to reap worker");
                }
            }
            WorkerChild::Thread(handle) => {
                if handle.join().is_err() {
                    warn!("Worker thread panicked");
                }
            }
        }
    }
}

impl WorkerHandle for ProcessWorker {
    fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let mut launched = self.launcher.launch(&self.spec)?;

        let outcome = poll_event(
            &mut launched.events,
            self.config.event_poll_interval,
            self.config.init_retries,
        )
        .and_then(|waited| match waited {
            Waited::Event(event) => expect_event(event, EventKind::Init, INIT_SUB_TYPE),
            Waited::TimedOut => Err(DeployError::Process(format!(
                "worker for device {} did not finish its handshake after {} polls",
                self.spec.device_id,
                self.config.init_retries + 1
            ))),
        })
        .and_then(|status| {
            if status == 0 {
                Ok(())
            } else {
                Err(DeployError::Process(format!(
                    "worker for device {} failed to initialize (status {})",
                    self.spec.device_id, status
                )))
            }
        });

        if let Err(e) = outcome {
            Self::reap(launched, true);
            return Err(e);
        }

        let pid = match &launched.child {
            WorkerChild::Process(pid) => Some(pid.as_raw()),
            WorkerChild::Thread(_) => None,
        };
        info!(
            device_id = self.spec.device_id,
            queue_id = self.spec.queue_id,
            mem_group = %self.spec.mem_group,
            pid,
            "Executor worker ready"
        );
        self.running = Some(launched);
        Ok(())
    }

    fn send_request(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.exchange(request, self.config.request_retries)
    }

    fn stop(&mut self) -> Result<()> {
        if self.running.is_none() {
            return Ok(());
        }
        let finalize = bincode::serialize(&WorkerRequest::Finalize)?;
        let graceful = self.exchange(&finalize, self.config.init_retries);
        if let Err(e) = &graceful {
            warn!(device_id = self.spec.device_id, error = %e, "Graceful finalize failed, terminating worker");
        }
        if let Some(running) = self.running.take() {
            Self::reap(running, graceful.is_err());
        }
        debug!(device_id = self.spec.device_id, "Executor worker stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn pid(&self) -> Option<i32> {
        match self.running.as_ref().map(|r| &r.child) {
            Some(WorkerChild::Process(pid)) => Some(pid.as_raw()),
            _ => None,
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ThreadLauncher, WorkerResponse};

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            event_poll_interval: Duration::from_millis(20),
            init_retries: 50,
            request_retries: 50,
            queue_depth: 4,
        }
    }

    fn spec() -> WorkerSpec {
        WorkerSpec {
            device_id: 0,
            queue_id: 1,
            mem_group: "mem_group_test".into(),
        }
    }

    #[test]
    fn test_thread_worker_round_trip() {
        let mut worker = ProcessWorker::new(spec(), Arc::new(ThreadLauncher), fast_config());
        worker.start().unwrap();
        assert!(worker.is_running());

        let request = WorkerRequest::LoadModel {
            root_model_id: 1,
            sub_model_id: 0,
            name: "head".into(),
            model: vec![1, 2, 3],
            input_queue_ids: vec![0],
            output_queue_ids: vec![1],
        };
        let reply = worker
            .send_request(&bincode::serialize(&request).unwrap())
            .unwrap();
        let response: WorkerResponse = bincode::deserialize(&reply).unwrap();
        assert_eq!(response.loaded_models, 1);

        let again = worker
            .send_request(&bincode::serialize(&request).unwrap())
            .unwrap();
        let response: WorkerResponse = bincode::deserialize(&again).unwrap();
        assert!(response.into_result().is_err());

        worker.stop().unwrap();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_request_without_start_fails() {
        let mut worker = ProcessWorker::new(spec(), Arc::new(ThreadLauncher), fast_config());
        let err = worker.send_request(&[]).unwrap_err();
        assert!(matches!(err, DeployError::Process(_)));
    }

    #[test]
    fn test_mismatched_event_is_hard_failure() {
        let event = CompletionEvent::new(EventKind::Complete, 4, 0);
        assert!(expect_event(event, EventKind::Complete, 4).is_ok());
        assert!(expect_event(event, EventKind::Complete, 5).is_err());
        assert!(expect_event(event, EventKind::Init, 4).is_err());
    }
}
