//! In-process queue primitives
//!
//! Behaves like a device queue subsystem: bounded queues per device, explicit
//! per-device initialisation and transition events for subscribed queues.
//! Used for host-only execution and in tests.

use super::{
    PrimitiveError, QueueEvent, QueueEventKind, QueueId, QueuePrimitives, Rejected, WorkMode,
};
use crate::plan::DeviceId;
use crate::transport::QueueBuffer;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct MemoryQueue {
    name: String,
    depth: u32,
    #[allow(dead_code)]
    mode: WorkMode,
    items: VecDeque<QueueBuffer>,
    subscriptions: HashSet<QueueEventKind>,
}

#[derive(Default)]
struct MemoryDevice {
    next_id: QueueId,
    queues: HashMap<QueueId, MemoryQueue>,
    events: VecDeque<QueueEvent>,
}

#[derive(Default)]
pub struct MemoryQueues {
    devices: Mutex<HashMap<DeviceId, MemoryDevice>>,
    event_ready: Condvar,
}

impl MemoryQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<DeviceId, MemoryDevice>>, PrimitiveError> {
        self.devices
            .lock()
            .map_err(|_| PrimitiveError::Failed("queue table lock poisoned".into()))
    }

    /// Number of live queues on `device`
    pub fn queue_count(&self, device: DeviceId) -> usize {
        self.lock()
            .map(|devices| devices.get(&device).map_or(0, |d| d.queues.len()))
            .unwrap_or(0)
    }

    /// Number of buffers currently held by `queue`
    pub fn queue_len(&self, device: DeviceId, queue: QueueId) -> usize {
        self.lock()
            .ok()
            .and_then(|devices| {
                devices
                    .get(&device)
                    .and_then(|d| d.queues.get(&queue))
                    .map(|q| q.items.len())
            })
            .unwrap_or(0)
    }

    fn publish(&self, dev: &mut MemoryDevice, queue: QueueId, kind: QueueEventKind) {
        let subscribed = dev
            .queues
            .get(&queue)
            .map_or(false, |q| q.subscriptions.contains(&kind));
        if subscribed {
            dev.events.push_back(QueueEvent {
                queue_id: queue,
                kind,
            });
            self.event_ready.notify_all();
        }
    }
}

impl QueuePrimitives for MemoryQueues {
    fn init_device(&self, device: DeviceId) -> Result<(), PrimitiveError> {
        let mut devices = self.lock()?;
        if devices.contains_key(&device) {
            return Err(PrimitiveError::AlreadyInitialized);
        }
        devices.insert(device, MemoryDevice::default());
        Ok(())
    }

    fn create_queue(
        &self,
        device: DeviceId,
        name: &str,
        depth: u32,
        mode: WorkMode,
    ) -> Result<QueueId, PrimitiveError> {
        if depth == 0 {
            return Err(PrimitiveError::Failed("queue depth must be positive".into()));
        }
        let mut devices = self.lock()?;
        let dev = devices
            .get_mut(&device)
            .ok_or(PrimitiveError::DeviceNotInitialized(device))?;
        if dev.queues.values().any(|q| q.name == name) {
            return Err(PrimitiveError::Failed(format!(
                "queue {} already exists",
                name
            )));
        }
        let id = dev.next_id;
        dev.next_id += 1;
        dev.queues.insert(
            id,
            MemoryQueue {
                name: name.to_string(),
                depth,
                mode,
                items: VecDeque::new(),
                subscriptions: HashSet::new(),
            },
        );
        Ok(id)
    }

    fn find_queue(&self, device: DeviceId, name: &str) -> Result<QueueId, PrimitiveError> {
        let devices = self.lock()?;
        let dev = devices
            .get(&device)
            .ok_or(PrimitiveError::DeviceNotInitialized(device))?;
        dev.queues
            .iter()
            .find(|(_, q)| q.name == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| PrimitiveError::Failed(format!("queue {} not found", name)))
    }

    fn destroy_queue(&self, device: DeviceId, queue: QueueId) -> Result<(), PrimitiveError> {
        let mut devices = self.lock()?;
        let dev = devices
            .get_mut(&device)
            .ok_or(PrimitiveError::DeviceNotInitialized(device))?;
        dev.queues
            .remove(&queue)
            .map(|_| ())
            .ok_or(PrimitiveError::QueueNotFound(queue))
    }

    fn subscribe(
        &self,
        device: DeviceId,
        queue: QueueId,
        kind: QueueEventKind,
    ) -> Result<(), PrimitiveError> {
        let mut devices = self.lock()?;
        let q = devices
            .get_mut(&device)
            .and_then(|d| d.queues.get_mut(&queue))
            .ok_or(PrimitiveError::QueueNotFound(queue))?;
        q.subscriptions.insert(kind);
        Ok(())
    }

    fn try_enqueue(
        &self,
        device: DeviceId,
        queue: QueueId,
        buffer: QueueBuffer,
    ) -> Result<(), Rejected> {
        let mut devices = match self.lock() {
            Ok(devices) => devices,
            Err(error) => return Err(Rejected { error, buffer }),
        };
        let Some(dev) = devices.get_mut(&device) else {
            return Err(Rejected {
                error: PrimitiveError::DeviceNotInitialized(device),
                buffer,
            });
        };
        let Some(q) = dev.queues.get_mut(&queue) else {
            return Err(Rejected {
                error: PrimitiveError::QueueNotFound(queue),
                buffer,
            });
        };
        if q.items.len() >= q.depth as usize {
            return Err(Rejected {
                error: PrimitiveError::Full,
                buffer,
            });
        }
        let was_empty = q.items.is_empty();
        q.items.push_back(buffer);
        if was_empty {
            self.publish(dev, queue, QueueEventKind::EmptyToNotEmpty);
        }
        Ok(())
    }

    fn try_dequeue(&self, device: DeviceId, queue: QueueId) -> Result<QueueBuffer, PrimitiveError> {
        let mut devices = self.lock()?;
        let dev = devices
            .get_mut(&device)
            .ok_or(PrimitiveError::DeviceNotInitialized(device))?;
        let q = dev
            .queues
            .get_mut(&queue)
            .ok_or(PrimitiveError::QueueNotFound(queue))?;
        let was_full = q.items.len() >= q.depth as usize;
        let buffer = q.items.pop_front().ok_or(PrimitiveError::Empty)?;
        if was_full {
            self.publish(dev, queue, QueueEventKind::FullToNotFull);
        }
        Ok(buffer)
    }

    fn wait_event(&self, device: DeviceId, timeout: Duration) -> Option<QueueEvent> {
        let deadline = Instant::now() + timeout;
        let mut devices = self.devices.lock().ok()?;
        loop {
            if let Some(event) = devices.get_mut(&device).and_then(|d| d.events.pop_front()) {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            devices = self.event_ready.wait_timeout(devices, deadline - now).ok()?.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_reported_once() {
        let queues = MemoryQueues::new();
        queues.init_device(0).unwrap();
        assert!(matches!(
            queues.init_device(0),
            Err(PrimitiveError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_bounded_depth() {
        let queues = MemoryQueues::new();
        queues.init_device(0).unwrap();
        let id = queues.create_queue(0, "q", 1, WorkMode::Pull).unwrap();
        queues.try_enqueue(0, id, QueueBuffer::new()).unwrap();
        let rejected = queues.try_enqueue(0, id, QueueBuffer::new()).unwrap_err();
        assert!(matches!(rejected.error, PrimitiveError::Full));
        assert_eq!(queues.queue_len(0, id), 1);
    }

    #[test]
    fn test_transition_events_only_for_subscribers() {
        let queues = MemoryQueues::new();
        queues.init_device(0).unwrap();
        let id = queues.create_queue(0, "q", 1, WorkMode::Pull).unwrap();
        queues.try_enqueue(0, id, QueueBuffer::new()).unwrap();
        assert!(queues.wait_event(0, Duration::from_millis(10)).is_none());

        queues
            .subscribe(0, id, QueueEventKind::FullToNotFull)
            .unwrap();
        queues.try_dequeue(0, id).unwrap();
        let event = queues.wait_event(0, Duration::from_millis(10)).unwrap();
        assert_eq!(event.kind, QueueEventKind::FullToNotFull);
        assert_eq!(event.queue_id, id);
    }

    #[test]
    fn test_find_and_destroy() {
        let queues = MemoryQueues::new();
        queues.init_device(2).unwrap();
        let id = queues.create_queue(2, "named", 4, WorkMode::Push).unwrap();
        assert_eq!(queues.find_queue(2, "named").unwrap(), id);
        queues.destroy_queue(2, id).unwrap();
        assert_eq!(queues.queue_count(2), 0);
        assert!(queues.find_queue(2, "named").is_err());
    }
}
