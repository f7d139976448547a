//! Shared weight content received from the orchestrator
//!
//! Content is keyed by name and shared by every session on the daemon, so a
//! re-deploy can skip weights that already arrived in full.

use crate::error::{lock_poisoned, DeployError, Result};
use crate::protocol::{ResponseBody, SharedContentOp};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

struct SharedContent {
    total: u64,
    data: Vec<u8>,
}

impl SharedContent {
    fn is_ready(&self) -> bool {
        self.data.len() as u64 == self.total
    }
}

#[derive(Default)]
pub struct SharedContentStore {
    entries: Mutex<HashMap<String, SharedContent>>,
}

impl SharedContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.get(key).map_or(false, SharedContent::is_ready))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn apply(&self, key: &str, op: SharedContentOp) -> Result<ResponseBody> {
        let mut entries = self.entries.lock().map_err(lock_poisoned("shared content"))?;
        let ready = match op {
            SharedContentOp::Query => entries.get(key).map_or(false, SharedContent::is_ready),
            SharedContentOp::Begin { total } => {
                match entries.get(key) {
                    Some(existing) if existing.is_ready() && existing.total == total => {}
                    _ => {
                        // the announced size is untrusted; storage grows per chunk
                        entries.insert(
                            key.to_string(),
                            SharedContent {
                                total,
                                data: Vec::new(),
                            },
                        );
                    }
                }
                entries.get(key).map_or(false, SharedContent::is_ready)
            }
            SharedContentOp::Chunk { offset, data } => {
                let entry = entries.get_mut(key).ok_or_else(|| {
                    DeployError::InvalidParam(format!("shared content {} was never begun", key))
                })?;
                if offset != entry.data.len() as u64 {
                    return Err(DeployError::InvalidParam(format!(
                        "shared content {} chunk at {} but {} bytes received",
                        key,
                        offset,
                        entry.data.len()
                    )));
                }
                if entry.data.len() as u64 + data.len() as u64 > entry.total {
                    return Err(DeployError::InvalidParam(format!(
                        "shared content {} overruns its announced {} bytes",
                        key, entry.total
                    )));
                }
                entry.data.try_reserve(data.len()).map_err(|e| {
                    DeployError::InvalidParam(format!("shared content {}: {}", key, e))
                })?;
                entry.data.extend_from_slice(&data);
                if entry.is_ready() {
                    debug!(key, total = entry.total, "Shared content complete");
                }
                entry.is_ready()
            }
        };
        Ok(ResponseBody::WeightStatus { ready })
    }
}
