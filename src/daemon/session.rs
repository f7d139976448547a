//! Client sessions on the daemon
//!
//! Every orchestrator connection authenticates with `Init` and receives a
//! client id. The session manager keeps one [`DaemonClient`] per id, evicts
//! clients whose heartbeat lapsed and mirrors the table to `client.json`.
//!
//! A client with a request in flight is never evicted; any completed request
//! counts as liveness.

use super::client_registry::ClientRegistryFile;
use super::context::DeployContext;
use super::DaemonServices;
use crate::config::SessionConfig;
use crate::error::{lock_poisoned, DeployError, Result};
use crate::protocol::{ClientId, Request, RequestBody, Response, ResponseBody};
use std::collections::HashMap;
use std::ops::Deref;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct DaemonClient {
    id: ClientId,
    peer: Option<SocketAddr>,
    context: Mutex<DeployContext>,
    last_heartbeat: Mutex<Instant>,
    in_flight: AtomicUsize,
}

/// Marks a client busy until dropped
pub struct ExecutingGuard {
    client: Arc<DaemonClient>,
}

impl Deref for ExecutingGuard {
    type Target = DaemonClient;

    fn deref(&self) -> &DaemonClient {
        &self.client
    }
}

impl Drop for ExecutingGuard {
    fn drop(&mut self) {
        self.client.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DaemonClient {
    fn new(id: ClientId, peer: Option<SocketAddr>, context: DeployContext) -> Self {
        Self {
            id,
            peer,
            context: Mutex::new(context),
            last_heartbeat: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_executing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn begin_execution(self: &Arc<Self>) -> ExecutingGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ExecutingGuard {
            client: Arc::clone(self),
        }
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        !self.is_executing() && self.idle_for() > timeout
    }

    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn refresh(&self) {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Instant::now();
        }
    }

    /// Callers hold an [`ExecutingGuard`] for the duration
    fn process(&self, device_id: i32, body: RequestBody) -> Result<ResponseBody> {
        let result = self
            .context
            .lock()
            .map_err(lock_poisoned("deploy context"))?
            .process(device_id, body);
        self.refresh();
        result
    }

    fn close(&self) {
        let mut context = match self.context.lock() {
            Ok(context) => context,
            Err(poisoned) => poisoned.into_inner(),
        };
        context.close();
    }
}

struct ClientTable {
    next_id: ClientId,
    clients: HashMap<ClientId, Arc<DaemonClient>>,
}

pub struct SessionManager {
    token: String,
    config: SessionConfig,
    services: Arc<DaemonServices>,
    registry: Option<ClientRegistryFile>,
    table: Mutex<ClientTable>,
    stop: Mutex<bool>,
    stop_signal: Condvar,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        token: impl Into<String>,
        config: SessionConfig,
        services: Arc<DaemonServices>,
    ) -> Result<Self> {
        let registry = config
            .registry_path
            .as_ref()
            .map(|path| ClientRegistryFile::create(path.clone()))
            .transpose()?;
        Ok(Self {
            token: token.into(),
            config,
            services,
            registry,
            table: Mutex::new(ClientTable {
                next_id: 1,
                clients: HashMap::new(),
            }),
            stop: Mutex::new(false),
            stop_signal: Condvar::new(),
            evictor: Mutex::new(None),
        })
    }

    pub fn services(&self) -> &Arc<DaemonServices> {
        &self.services
    }

    /// Start the background sweep that evicts expired clients
    pub fn start_eviction(self: &Arc<Self>) -> Result<()> {
        let mut evictor = self.evictor.lock().map_err(lock_poisoned("evictor"))?;
        if evictor.is_some() {
            return Ok(());
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let handle = thread::Builder::new()
            .name("session-evictor".into())
            .spawn(move || loop {
                let Some(manager) = weak.upgrade() else { break };
                let stopped = match manager.stop.lock() {
                    Ok(stop) if *stop => true,
                    Ok(stop) => match manager.stop_signal.wait_timeout(stop, interval) {
                        Ok((stop, _)) => *stop,
                        Err(_) => true,
                    },
                    Err(_) => true,
                };
                if stopped {
                    break;
                }
                let evicted = manager.check_expired_clients();
                if !evicted.is_empty() {
                    info!(clients = ?evicted, "Evicted clients with lapsed heartbeats");
                }
            })?;
        *evictor = Some(handle);
        Ok(())
    }

    /// Stop the sweep and close every client
    pub fn shutdown(&self) {
        if let Ok(mut stop) = self.stop.lock() {
            *stop = true;
        }
        self.stop_signal.notify_all();
        let handle = self.evictor.lock().ok().and_then(|mut e| e.take());
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Session evictor panicked");
            }
        }

        let ids: Vec<ClientId> = self
            .table
            .lock()
            .map(|t| t.clients.keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let _ = self.close_client(id);
        }
    }

    /// Dispatch one request; failures become error responses
    pub fn process(&self, request: Request, peer: Option<SocketAddr>) -> Response {
        let name = request.body.name();
        let client_id = request.client_id;
        let result = match request.body {
            RequestBody::Init { token } => self.process_init_request(&token, peer),
            RequestBody::Heartbeat => self
                .process_heartbeat_request(client_id)
                .map(|()| ResponseBody::None),
            RequestBody::Disconnect => self
                .process_disconnect_request(client_id)
                .map(|()| ResponseBody::None),
            body => self
                .acquire_client(client_id)
                .and_then(|client| client.process(request.device_id, body)),
        };
        if let Err(e) = &result {
            warn!(client_id, request = name, code = %e.code(), error = %e, "Request failed");
        }
        Response::from_result(result)
    }

    pub fn process_init_request(&self, token: &str, peer: Option<SocketAddr>) -> Result<ResponseBody> {
        if token != self.token {
            return Err(DeployError::Auth("token mismatch".into()));
        }

        let mut table = self.table.lock().map_err(lock_poisoned("client table"))?;
        let client_id = table.next_id;
        table.next_id = client_id
            .checked_add(1)
            .ok_or_else(|| DeployError::Internal("client ids exhausted".into()))?;
        let context = DeployContext::new(client_id, Arc::clone(&self.services));
        table
            .clients
            .insert(client_id, Arc::new(DaemonClient::new(client_id, peer, context)));
        drop(table);

        if let (Some(registry), Some(peer)) = (&self.registry, peer) {
            if let Err(e) = registry.add(client_id, peer) {
                warn!(client_id, error = %e, "Failed to record client");
            }
        }
        info!(client_id, peer = ?peer, "Client connected");
        Ok(ResponseBody::Init {
            client_id,
            device_count: self.services.device_count,
        })
    }

    /// Refresh the client's heartbeat, or close it if it already lapsed
    pub fn process_heartbeat_request(&self, client_id: ClientId) -> Result<()> {
        let mut table = self.table.lock().map_err(lock_poisoned("client table"))?;
        let client = table
            .clients
            .get(&client_id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("client {} is not connected", client_id)))?;
        if client.is_expired(self.config.heartbeat_timeout) {
            let idle = client.idle_for();
            table.clients.remove(&client_id);
            drop(table);
            self.release(client);
            return Err(DeployError::Timeout(format!(
                "client {} missed its heartbeat for {:?}",
                client_id, idle
            )));
        }
        client.refresh();
        drop(table);
        debug!(client_id, "Heartbeat");
        Ok(())
    }

    pub fn process_disconnect_request(&self, client_id: ClientId) -> Result<()> {
        self.close_client(client_id)?;
        info!(client_id, "Client disconnected");
        Ok(())
    }

    pub fn get_client(&self, client_id: ClientId) -> Result<Arc<DaemonClient>> {
        self.table
            .lock()
            .map_err(lock_poisoned("client table"))?
            .clients
            .get(&client_id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("client {} is not connected", client_id)))
    }

    /// Look up a client and mark it executing before the table is unlocked,
    /// so the eviction sweep cannot remove it mid-request
    pub fn acquire_client(&self, client_id: ClientId) -> Result<ExecutingGuard> {
        let table = self.table.lock().map_err(lock_poisoned("client table"))?;
        let client = table
            .clients
            .get(&client_id)
            .ok_or_else(|| DeployError::NotFound(format!("client {} is not connected", client_id)))?;
        Ok(client.begin_execution())
    }

    pub fn client_count(&self) -> usize {
        self.table.lock().map(|t| t.clients.len()).unwrap_or(0)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .table
            .lock()
            .map(|t| t.clients.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Remove the client and release everything its context holds
    pub fn close_client(&self, client_id: ClientId) -> Result<()> {
        let client = self
            .table
            .lock()
            .map_err(lock_poisoned("client table"))?
            .clients
            .remove(&client_id)
            .ok_or_else(|| DeployError::NotFound(format!("client {} is not connected", client_id)))?;
        self.release(client);
        Ok(())
    }

    /// Tear down a client already removed from the table
    fn release(&self, client: Arc<DaemonClient>) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.remove(client.id) {
                warn!(client_id = client.id, error = %e, "Failed to drop client record");
            }
        }
        client.close();
        debug!(client_id = client.id, "Client closed");
    }

    /// Close every idle client whose heartbeat lapsed; returns their ids
    pub fn check_expired_clients(&self) -> Vec<ClientId> {
        let expired: Vec<Arc<DaemonClient>> = match self.table.lock() {
            Ok(mut table) => {
                let timeout = self.config.heartbeat_timeout;
                let ids: Vec<ClientId> = table
                    .clients
                    .values()
                    .filter(|c| c.is_expired(timeout))
                    .map(|c| c.id)
                    .collect();
                ids.iter()
                    .filter_map(|id| table.clients.remove(id))
                    .collect()
            }
            Err(_) => return Vec::new(),
        };
        let mut ids = Vec::with_capacity(expired.len());
        for client in expired {
            ids.push(client.id);
            self.release(client);
        }
        ids
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
