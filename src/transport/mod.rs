//! Queue transport: bounded per-device message queues with blocking
//! enqueue/dequeue
//!
//! The low-level device queue subsystem sits behind [`QueuePrimitives`]
//! (non-blocking calls plus transition events). [`QueueTransport`] adds:
//! - lazy, idempotent per-device initialisation
//! - per-(device, queue) sequence stamps
//! - blocking waits woken by a per-device event-listener thread, bounded by
//!   `TransportConfig::{poll_interval, max_retries}`

pub mod buffer;
pub mod memory;

use crate::config::TransportConfig;
use crate::error::{lock_poisoned, DeployError, Result};
use crate::plan::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use buffer::{BufferHeader, DataType, QueueBuffer, Tensor, TensorDesc};
pub use memory::MemoryQueues;

pub type QueueId = u32;

/// How the consumer side of a queue is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkMode {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEventKind {
    FullToNotFull,
    EmptyToNotEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEvent {
    pub queue_id: QueueId,
    pub kind: QueueEventKind,
}

#[derive(Debug, Error)]
pub enum PrimitiveError {
    #[error("queue subsystem already initialized")]
    AlreadyInitialized,
    #[error("device {0} queue subsystem not initialized")]
    DeviceNotInitialized(DeviceId),
    #[error("queue {0} not found")]
    QueueNotFound(QueueId),
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
    #[error("{0}")]
    Failed(String),
}

/// A buffer the queue refused; ownership returns to the producer
#[derive(Debug)]
pub struct Rejected {
    pub error: PrimitiveError,
    pub buffer: QueueBuffer,
}

/// Device queue primitives: create/destroy/enqueue/dequeue without blocking,
/// plus a blocking wait for subscribed transition events
pub trait QueuePrimitives: Send + Sync {
    fn init_device(&self, device: DeviceId) -> std::result::Result<(), PrimitiveError>;
    fn create_queue(
        &self,
        device: DeviceId,
        name: &str,
        depth: u32,
        mode: WorkMode,
    ) -> std::result::Result<QueueId, PrimitiveError>;
    fn find_queue(&self, device: DeviceId, name: &str)
        -> std::result::Result<QueueId, PrimitiveError>;
    fn destroy_queue(&self, device: DeviceId, queue: QueueId)
        -> std::result::Result<(), PrimitiveError>;
    fn subscribe(
        &self,
        device: DeviceId,
        queue: QueueId,
        kind: QueueEventKind,
    ) -> std::result::Result<(), PrimitiveError>;
    fn try_enqueue(
        &self,
        device: DeviceId,
        queue: QueueId,
        buffer: QueueBuffer,
    ) -> std::result::Result<(), Rejected>;
    fn try_dequeue(
        &self,
        device: DeviceId,
        queue: QueueId,
    ) -> std::result::Result<QueueBuffer, PrimitiveError>;
    fn wait_event(&self, device: DeviceId, timeout: Duration) -> Option<QueueEvent>;
}

/// Result of a dequeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item { sequence: u64, value: T },
    EndOfSequence,
}

/// Wait points for one device, signalled by its listener thread
struct DeviceWaiters {
    lock: Mutex<()>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl DeviceWaiters {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    fn wait(&self, condvar: &Condvar, timeout: Duration) {
        if let Ok(guard) = self.lock.lock() {
            let _ = condvar.wait_timeout(guard, timeout);
        }
    }
}

struct DeviceState {
    waiters: Arc<DeviceWaiters>,
    listener: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub devices: usize,
    pub queues: usize,
}

pub struct QueueTransport {
    primitives: Arc<dyn QueuePrimitives>,
    config: TransportConfig,
    devices: Mutex<HashMap<DeviceId, DeviceState>>,
    sequences: Mutex<HashMap<(DeviceId, QueueId), u64>>,
    shutdown: Arc<AtomicBool>,
}

impl QueueTransport {
    pub fn new(primitives: Arc<dyn QueuePrimitives>, config: TransportConfig) -> Self {
        Self {
            primitives,
            config,
            devices: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Transport over fresh in-process queues
    pub fn in_memory(config: TransportConfig) -> Self {
        Self::new(Arc::new(MemoryQueues::new()), config)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Initialise `device` once and start its event listener
    fn device_waiters(&self, device: DeviceId) -> Result<Arc<DeviceWaiters>> {
        let mut devices = self.devices.lock().map_err(lock_poisoned("transport device"))?;
        if let Some(state) = devices.get(&device) {
            return Ok(Arc::clone(&state.waiters));
        }

        match self.primitives.init_device(device) {
            Ok(()) | Err(PrimitiveError::AlreadyInitialized) => {}
            Err(e) => return Err(DeployError::transport("init", device, e.to_string())),
        }

        let waiters = Arc::new(DeviceWaiters::new());
        let listener = {
            let waiters = Arc::clone(&waiters);
            let primitives = Arc::clone(&self.primitives);
            let shutdown = Arc::clone(&self.shutdown);
            let interval = self.config.poll_interval;
            thread::Builder::new()
                .name(format!("queue-events-{}", device))
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        let Some(event) = primitives.wait_event(device, interval) else {
                            continue;
                        };
                        let _guard = waiters.lock.lock();
                        match event.kind {
                            QueueEventKind::FullToNotFull => waiters.not_full.notify_all(),
                            QueueEventKind::EmptyToNotEmpty => waiters.not_empty.notify_all(),
                        }
                    }
                })?
        };
        debug!(device_id = device, "Queue subsystem initialized");

        devices.insert(
            device,
            DeviceState {
                waiters: Arc::clone(&waiters),
                listener: Some(listener),
            },
        );
        Ok(waiters)
    }

    pub fn create_queue(
        &self,
        device: DeviceId,
        name: &str,
        depth: u32,
        mode: WorkMode,
    ) -> Result<QueueId> {
        self.device_waiters(device)?;
        if name.is_empty() || name.len() > self.config.max_queue_name_len {
            return Err(DeployError::InvalidParam(format!(
                "queue name length {} not in 1..={}",
                name.len(),
                self.config.max_queue_name_len
            )));
        }
        let queue = self
            .primitives
            .create_queue(device, name, depth, mode)
            .map_err(|e| DeployError::transport("create_queue", device, e.to_string()))?;
        for kind in [QueueEventKind::FullToNotFull, QueueEventKind::EmptyToNotEmpty] {
            if let Err(e) = self.primitives.subscribe(device, queue, kind) {
                let _ = self.primitives.destroy_queue(device, queue);
                return Err(DeployError::transport("subscribe", device, e.to_string()));
            }
        }
        self.sequences
            .lock()
            .map_err(lock_poisoned("sequence table"))?
            .insert((device, queue), 0);
        debug!(device_id = device, queue_id = queue, name, depth, ?mode, "Queue created");
        Ok(queue)
    }

    /// Resolve a queue created outside this transport
    pub fn find_queue(&self, device: DeviceId, name: &str) -> Result<QueueId> {
        self.device_waiters(device)?;
        self.primitives
            .find_queue(device, name)
            .map_err(|e| DeployError::transport("find_queue", device, e.to_string()))
    }

    pub fn destroy_queue(&self, device: DeviceId, queue: QueueId) -> Result<()> {
        self.sequences
            .lock()
            .map_err(lock_poisoned("sequence table"))?
            .remove(&(device, queue));
        self.primitives
            .destroy_queue(device, queue)
            .map_err(|e| DeployError::transport("destroy_queue", device, e.to_string()))?;
        debug!(device_id = device, queue_id = queue, "Queue destroyed");
        Ok(())
    }

    fn next_sequence(&self, device: DeviceId, queue: QueueId) -> Result<u64> {
        let mut sequences = self.sequences.lock().map_err(lock_poisoned("sequence table"))?;
        // queues resolved by name get a counter on first use
        let counter = sequences.entry((device, queue)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    /// Enqueue one buffer, letting `fill` write the payload
    pub fn enqueue<F>(&self, device: DeviceId, queue: QueueId, fill: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<()>,
    {
        self.enqueue_buffer(device, queue, false, fill)
    }

    pub fn enqueue_tensor(&self, device: DeviceId, queue: QueueId, tensor: &Tensor) -> Result<()> {
        self.enqueue(device, queue, |payload| tensor.encode_into(payload))
    }

    /// Mark the end of the stream on `queue`
    pub fn enqueue_end_of_sequence(&self, device: DeviceId, queue: QueueId) -> Result<()> {
        self.enqueue_buffer(device, queue, true, |_| Ok(()))
    }

    fn enqueue_buffer<F>(&self, device: DeviceId, queue: QueueId, eos: bool, fill: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<()>,
    {
        let waiters = self.device_waiters(device)?;
        let mut buffer = QueueBuffer::new();
        buffer.header.end_of_sequence = false;
        fill(&mut buffer.payload)?;
        buffer.header.end_of_sequence = eos;
        buffer.header.sequence = self.next_sequence(device, queue)?;

        for _ in 0..=self.config.max_retries {
            match self.primitives.try_enqueue(device, queue, buffer) {
                Ok(()) => return Ok(()),
                Err(Rejected {
                    error: PrimitiveError::Full,
                    buffer: returned,
                }) => {
                    buffer = returned;
                    waiters.wait(&waiters.not_full, self.config.poll_interval);
                }
                Err(Rejected { error, .. }) => {
                    return Err(DeployError::transport("enqueue", device, error.to_string()));
                }
            }
        }
        warn!(device_id = device, queue_id = queue, "Enqueue retry budget exhausted");
        Err(DeployError::transport(
            "enqueue",
            device,
            format!(
                "queue {} still full after {} retries",
                queue, self.config.max_retries
            ),
        ))
    }

    fn dequeue_buffer(&self, device: DeviceId, queue: QueueId) -> Result<QueueBuffer> {
        let waiters = self.device_waiters(device)?;
        for _ in 0..=self.config.max_retries {
            match self.primitives.try_dequeue(device, queue) {
                Ok(buffer) => return Ok(buffer),
                Err(PrimitiveError::Empty) => {
                    waiters.wait(&waiters.not_empty, self.config.poll_interval);
                }
                Err(e) => return Err(DeployError::transport("dequeue", device, e.to_string())),
            }
        }
        warn!(device_id = device, queue_id = queue, "Dequeue retry budget exhausted");
        Err(DeployError::transport(
            "dequeue",
            device,
            format!(
                "queue {} still empty after {} retries",
                queue, self.config.max_retries
            ),
        ))
    }

    /// Dequeue raw payload bytes
    pub fn dequeue(&self, device: DeviceId, queue: QueueId) -> Result<Dequeued<Vec<u8>>> {
        let buffer = self.dequeue_buffer(device, queue)?;
        if buffer.header.end_of_sequence {
            return Ok(Dequeued::EndOfSequence);
        }
        Ok(Dequeued::Item {
            sequence: buffer.header.sequence,
            value: buffer.payload,
        })
    }

    pub fn dequeue_tensor(&self, device: DeviceId, queue: QueueId) -> Result<Dequeued<Tensor>> {
        let buffer = self.dequeue_buffer(device, queue)?;
        if buffer.header.end_of_sequence {
            return Ok(Dequeued::EndOfSequence);
        }
        Ok(Dequeued::Item {
            sequence: buffer.header.sequence,
            value: Tensor::decode(&buffer.payload)?,
        })
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            devices: self.devices.lock().map(|d| d.len()).unwrap_or(0),
            queues: self.sequences.lock().map(|s| s.len()).unwrap_or(0),
        }
    }
}

impl Drop for QueueTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut devices) = self.devices.lock() {
            for (_, state) in devices.iter_mut() {
                if let Some(listener) = state.listener.take() {
                    let _ = listener.join();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            poll_interval: Duration::from_millis(5),
            max_retries: 20,
            max_queue_name_len: 16,
        }
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let transport = QueueTransport::in_memory(fast_config());
        let q = transport.create_queue(0, "seq", 8, WorkMode::Pull).unwrap();
        for i in 0..3u8 {
            transport.enqueue(0, q, |p| {
                p.push(i);
                Ok(())
            }).unwrap();
        }
        let mut last = 0;
        for i in 0..3u8 {
            match transport.dequeue(0, q).unwrap() {
                Dequeued::Item { sequence, value } => {
                    assert!(sequence > last);
                    last = sequence;
                    assert_eq!(value, vec![i]);
                }
                Dequeued::EndOfSequence => panic!("unexpected end of sequence"),
            }
        }
    }

    #[test]
    fn test_end_of_sequence_reported() {
        let transport = QueueTransport::in_memory(fast_config());
        let q = transport.create_queue(1, "eos", 2, WorkMode::Pull).unwrap();
        transport.enqueue_end_of_sequence(1, q).unwrap();
        assert_eq!(transport.dequeue_tensor(1, q).unwrap(), Dequeued::EndOfSequence);
    }

    #[test]
    fn test_tensor_round_trip_through_queue() {
        let transport = QueueTransport::in_memory(fast_config());
        let q = transport.create_queue(0, "t", 2, WorkMode::Pull).unwrap();
        let tensor = Tensor::new(DataType::Int32, vec![3], vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        transport.enqueue_tensor(0, q, &tensor).unwrap();
        match transport.dequeue_tensor(0, q).unwrap() {
            Dequeued::Item { value, .. } => assert_eq!(value, tensor),
            Dequeued::EndOfSequence => panic!("unexpected end of sequence"),
        }
    }

    #[test]
    fn test_enqueue_on_full_queue_gives_up() {
        let transport = QueueTransport::in_memory(fast_config());
        let q = transport.create_queue(0, "full", 1, WorkMode::Pull).unwrap();
        transport.enqueue(0, q, |_| Ok(())).unwrap();

        let start = Instant::now();
        let err = transport.enqueue(0, q, |_| Ok(())).unwrap_err();
        assert!(matches!(err, DeployError::Transport { op: "enqueue", .. }));
        // bounded by poll interval x retries, never unbounded
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_blocked_enqueue_woken_by_consumer() {
        let transport = Arc::new(QueueTransport::new(
            Arc::new(MemoryQueues::new()),
            TransportConfig {
                poll_interval: Duration::from_millis(50),
                max_retries: 100,
                max_queue_name_len: 16,
            },
        ));
        let q = transport.create_queue(0, "wake", 1, WorkMode::Pull).unwrap();
        transport.enqueue(0, q, |_| Ok(())).unwrap();

        let consumer = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                transport.dequeue(0, q).unwrap();
            })
        };
        transport.enqueue(0, q, |p| {
            p.push(9);
            Ok(())
        }).unwrap();
        consumer.join().unwrap();

        match transport.dequeue(0, q).unwrap() {
            Dequeued::Item { value, .. } => assert_eq!(value, vec![9]),
            Dequeued::EndOfSequence => panic!("unexpected end of sequence"),
        }
    }

    #[test]
    fn test_fill_failure_frees_buffer() {
        let transport = QueueTransport::in_memory(fast_config());
        let q = transport.create_queue(0, "fill", 2, WorkMode::Pull).unwrap();
        let err = transport
            .enqueue(0, q, |_| Err(DeployError::InvalidParam("bad payload".into())))
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidParam(_)));
        assert!(transport.dequeue(0, q).is_err());
    }

    #[test]
    fn test_name_length_validated() {
        let transport = QueueTransport::in_memory(fast_config());
        let err = transport
            .create_queue(0, "a-name-that-is-too-long", 2, WorkMode::Pull)
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidParam(_)));
        assert!(transport.create_queue(0, "", 2, WorkMode::Pull).is_err());
    }

    #[test]
    fn test_destroy_removes_sequence_entry() {
        let transport = QueueTransport::in_memory(fast_config());
        let q = transport.create_queue(3, "gone", 2, WorkMode::Push).unwrap();
        assert_eq!(transport.stats().queues, 1);
        transport.destroy_queue(3, q).unwrap();
        assert_eq!(transport.stats().queues, 0);
        assert_eq!(transport.stats().devices, 1);
    }
}
