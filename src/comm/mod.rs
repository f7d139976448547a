//! Collective-communication backends
//!
//! Tag endpoints are point-to-point channels opened through a
//! [`CommBackend`]. Backends are registered by name in a [`CommRegistry`] and
//! one of them is bound at startup; everything downstream only sees the
//! trait object.

use crate::error::{lock_poisoned, DeployError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

pub type CommHandle = u64;
pub type TagId = u64;

pub trait CommBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Open a communicator between `local_address` and `peer_address`
    fn create_handle(&self, local_address: &str, peer_address: &str) -> Result<CommHandle>;

    fn create_tag(&self, handle: CommHandle, name: &str) -> Result<TagId>;

    fn destroy_tag(&self, handle: CommHandle, tag: TagId) -> Result<()>;

    fn release_handle(&self, handle: CommHandle) -> Result<()>;

    /// Whether this backend consumes cluster rank tables
    fn supports_rank_table(&self) -> bool {
        false
    }

    fn init_rank_table(&self, _rank_table: &str) -> Result<()> {
        Err(DeployError::NotFound(format!(
            "backend {} has no rank table support",
            self.name()
        )))
    }
}

/// Named backends, one of which gets bound for the life of the process
#[derive(Default)]
pub struct CommRegistry {
    backends: HashMap<String, Arc<dyn CommBackend>>,
    bound: OnceLock<Arc<dyn CommBackend>>,
}

impl CommRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the in-process loopback backend
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LoopbackComm::new()));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn CommBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn available(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Bind `name` as the process backend; rebinding to another name fails
    pub fn bind(&self, name: &str) -> Result<Arc<dyn CommBackend>> {
        if let Some(bound) = self.bound.get() {
            if bound.name() == name {
                return Ok(Arc::clone(bound));
            }
            return Err(DeployError::Config(format!(
                "communication backend already bound to {}",
                bound.name()
            )));
        }
        let backend = self.backends.get(name).ok_or_else(|| {
            DeployError::Config(format!(
                "unknown communication backend {} (available: {})",
                name,
                self.available().join(", ")
            ))
        })?;
        let bound = self.bound.get_or_init(|| Arc::clone(backend));
        info!(backend = bound.name(), "Communication backend bound");
        Ok(Arc::clone(bound))
    }

    pub fn bound(&self) -> Option<Arc<dyn CommBackend>> {
        self.bound.get().cloned()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommCounts {
    pub handles: usize,
    pub tags: usize,
}

#[derive(Default)]
struct LoopbackState {
    next_handle: CommHandle,
    next_tag: TagId,
    handles: HashMap<CommHandle, (String, String)>,
    tags: HashMap<TagId, (CommHandle, String)>,
    rank_table: Option<String>,
}

/// Bookkeeping-only backend for single-host runs and tests
pub struct LoopbackComm {
    state: Mutex<LoopbackState>,
    rank_table: bool,
}

impl Default for LoopbackComm {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackComm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState::default()),
            rank_table: true,
        }
    }

    pub fn without_rank_table() -> Self {
        Self {
            rank_table: false,
            ..Self::new()
        }
    }

    pub fn counts(&self) -> CommCounts {
        self.state
            .lock()
            .map(|s| CommCounts {
                handles: s.handles.len(),
                tags: s.tags.len(),
            })
            .unwrap_or_default()
    }

    pub fn rank_table(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.rank_table.clone())
    }
}

impl CommBackend for LoopbackComm {
    fn name(&self) -> &str {
        "loopback"
    }

    fn create_handle(&self, local_address: &str, peer_address: &str) -> Result<CommHandle> {
        let mut state = self.state.lock().map_err(lock_poisoned("loopback comm"))?;
        state.next_handle += 1;
        let handle = state.next_handle;
        state
            .handles
            .insert(handle, (local_address.to_string(), peer_address.to_string()));
        debug!(handle, local_address, peer_address, "Comm handle created");
        Ok(handle)
    }

    fn create_tag(&self, handle: CommHandle, name: &str) -> Result<TagId> {
        let mut state = self.state.lock().map_err(lock_poisoned("loopback comm"))?;
        if !state.handles.contains_key(&handle) {
            return Err(DeployError::NotFound(format!("comm handle {}", handle)));
        }
        if state.tags.values().any(|(h, n)| *h == handle && n == name) {
            return Err(DeployError::InvalidParam(format!(
                "tag {} already exists on handle {}",
                name, handle
            )));
        }
        state.next_tag += 1;
        let tag = state.next_tag;
        state.tags.insert(tag, (handle, name.to_string()));
        Ok(tag)
    }

    fn destroy_tag(&self, handle: CommHandle, tag: TagId) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_poisoned("loopback comm"))?;
        match state.tags.get(&tag) {
            Some((owner, _)) if *owner == handle => {
                state.tags.remove(&tag);
                Ok(())
            }
            _ => Err(DeployError::NotFound(format!(
                "tag {} on handle {}",
                tag, handle
            ))),
        }
    }

    fn release_handle(&self, handle: CommHandle) -> Result<()> {
        let mut state = self.state.lock().map_err(lock_poisoned("loopback comm"))?;
        if state.tags.values().any(|(owner, _)| *owner == handle) {
            return Err(DeployError::Internal(format!(
                "comm handle {} still has live tags",
                handle
            )));
        }
        state
            .handles
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| DeployError::NotFound(format!("comm handle {}", handle)))
    }

    fn supports_rank_table(&self) -> bool {
        self.rank_table
    }

    fn init_rank_table(&self, rank_table: &str) -> Result<()> {
        if !self.rank_table {
            return Err(DeployError::NotFound(
                "loopback backend built without rank table support".into(),
            ));
        }
        let mut state = self.state.lock().map_err(lock_poisoned("loopback comm"))?;
        state.rank_table = Some(rank_table.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_once() {
        let registry = CommRegistry::with_defaults();
        assert!(registry.bound().is_none());
        let backend = registry.bind("loopback").unwrap();
        assert_eq!(backend.name(), "loopback");
        assert!(registry.bind("loopback").is_ok());
        assert!(registry.bound().is_some());
    }

    #[test]
    fn test_unknown_backend() {
        let registry = CommRegistry::with_defaults();
        let err = registry.bind("vendor").err().expect("bind should fail");
        assert!(matches!(err, DeployError::Config(_)));
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn test_handle_release_requires_tags_gone() {
        let comm = LoopbackComm::new();
        let handle = comm.create_handle("a:1", "b:2").unwrap();
        let tag = comm.create_tag(handle, "t").unwrap();
        assert!(comm.create_tag(handle, "t").is_err());
        assert!(comm.release_handle(handle).is_err());

        comm.destroy_tag(handle, tag).unwrap();
        comm.release_handle(handle).unwrap();
        assert_eq!(comm.counts(), CommCounts::default());
    }

    #[test]
    fn test_rank_table_capability() {
        let comm = LoopbackComm::new();
        comm.init_rank_table("{}").unwrap();
        assert_eq!(comm.rank_table().as_deref(), Some("{}"));

        let bare = LoopbackComm::without_rank_table();
        assert!(!bare.supports_rank_table());
        assert!(bare.init_rank_table("{}").is_err());
    }
}
