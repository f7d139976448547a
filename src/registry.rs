//! Route registry: resolved exchange routes kept for later query and teardown

use crate::error::{lock_poisoned, DeployError, Result};
use crate::exchange::ExchangeRoute;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub type RouteId = u64;

#[derive(Default)]
struct RegistryInner {
    next_id: RouteId,
    routes: HashMap<RouteId, Arc<ExchangeRoute>>,
}

/// Route ids are handed out in increasing order and never reused
#[derive(Default)]
pub struct RouteRegistry {
    inner: Mutex<RegistryInner>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, route: ExchangeRoute) -> Result<RouteId> {
        let mut inner = self.inner.lock().map_err(lock_poisoned("route registry"))?;
        inner.next_id = inner
            .next_id
            .checked_add(1)
            .ok_or_else(|| DeployError::Internal("route id space exhausted".into()))?;
        let id = inner.next_id;
        debug!(route_id = id, device_id = route.device(), "Route registered");
        inner.routes.insert(id, Arc::new(route));
        Ok(id)
    }

    pub fn query(&self, id: RouteId) -> Result<Arc<ExchangeRoute>> {
        let inner = self.inner.lock().map_err(lock_poisoned("route registry"))?;
        inner
            .routes
            .get(&id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("route {}", id)))
    }

    pub fn remove(&self, id: RouteId) -> Result<Arc<ExchangeRoute>> {
        let mut inner = self.inner.lock().map_err(lock_poisoned("route registry"))?;
        inner
            .routes
            .remove(&id)
            .ok_or_else(|| DeployError::NotFound(format!("route {}", id)))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.routes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
