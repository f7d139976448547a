//! Device-side deployment daemon
//!
//! - `server`: TCP accept loop, one thread per orchestrator connection
//! - `session`: client table, token check, heartbeat expiry
//! - `context`: per-client deployment state and request dispatch
//! - `shared_content`: weight content shared by every client
//! - `client_registry`: the persisted `client.json`

pub mod client_registry;
pub mod context;
pub mod server;
pub mod session;
pub mod shared_content;

pub use client_registry::{ClientRegistryDoc, ClientRegistryFile, ConnectionRecord};
pub use context::{DeployContext, ModelKey, SubmodelQueues};
pub use server::DaemonServer;
pub use session::{DaemonClient, ExecutingGuard, SessionManager};
pub use shared_content::SharedContentStore;

use crate::comm::CommBackend;
use crate::config::ExecutorConfig;
use crate::exchange::QueueExchangeService;
use crate::executor::WorkerLauncher;
use crate::registry::RouteRegistry;
use crate::transport::QueueTransport;
use std::sync::Arc;

/// Device-wide services every client context shares
pub struct DaemonServices {
    pub transport: Arc<QueueTransport>,
    pub exchange: Arc<QueueExchangeService>,
    pub comm: Arc<dyn CommBackend>,
    pub routes: Arc<RouteRegistry>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub executor_config: ExecutorConfig,
    pub shared_content: SharedContentStore,
    /// Reported to clients in the `Init` reply
    pub device_count: u32,
}

impl DaemonServices {
    pub fn new(
        transport: Arc<QueueTransport>,
        comm: Arc<dyn CommBackend>,
        launcher: Arc<dyn WorkerLauncher>,
        executor_config: ExecutorConfig,
    ) -> Self {
        Self {
            exchange: Arc::new(QueueExchangeService::new(Arc::clone(&transport))),
            transport,
            comm,
            routes: Arc::new(RouteRegistry::new()),
            launcher,
            executor_config,
            shared_content: SharedContentStore::new(),
            device_count: 1,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use crate::comm::LoopbackComm;
        use crate::config::TransportConfig;
        use crate::executor::ThreadLauncher;
        use std::time::Duration;

        Self::new(
            Arc::new(QueueTransport::in_memory(TransportConfig::default())),
            Arc::new(LoopbackComm::new()),
            Arc::new(ThreadLauncher),
            ExecutorConfig {
                event_poll_interval: Duration::from_millis(20),
                init_retries: 50,
                request_retries: 50,
                queue_depth: 4,
            },
        )
    }
}
