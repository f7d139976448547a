//! Control-plane clients the orchestrator uses to reach device daemons

use crate::config::RemoteDeviceEntry;
use crate::daemon::SessionManager;
use crate::error::{lock_poisoned, DeployError, ErrorCode, Result};
use crate::plan::DeviceKey;
use crate::protocol::{
    read_message, write_message, ClientId, MessageId, Request, RequestBody, Response, ResponseBody,
};
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One authenticated session with the daemon serving `device()`
pub trait Deployer: Send + Sync {
    fn device(&self) -> DeviceKey;

    fn process(&self, body: RequestBody) -> Result<ResponseBody>;
}

fn expect_init(body: ResponseBody) -> Result<ClientId> {
    match body {
        ResponseBody::Init { client_id, .. } => Ok(client_id),
        other => Err(DeployError::Internal(format!(
            "expected an Init reply, got {:?}",
            other
        ))),
    }
}

struct Session {
    stream: TcpStream,
    client_id: ClientId,
    next_message_id: MessageId,
}

impl Session {
    fn open(device: DeviceKey, address: &str, token: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).map_err(|e| {
            DeployError::transport("connect", device.device_id, format!("{}: {}", address, e))
        })?;
        stream.set_nodelay(true)?;
        let mut session = Self {
            stream,
            client_id: 0,
            next_message_id: 0,
        };
        let body = session.call(
            device,
            RequestBody::Init {
                token: token.to_string(),
            },
        )?;
        session.client_id = expect_init(body)?;
        Ok(session)
    }

    fn call(&mut self, device: DeviceKey, body: RequestBody) -> Result<ResponseBody> {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        let message_id = self.next_message_id;
        let request = Request {
            client_id: self.client_id,
            device_id: device.device_id,
            body,
        };
        write_message(&mut self.stream, &request, message_id)?;
        let (response, reply_id): (Response, MessageId) = read_message(&mut self.stream)?;
        if reply_id != message_id {
            return Err(DeployError::transport(
                "call",
                device.device_id,
                format!("reply {} does not match request {}", reply_id, message_id),
            ));
        }
        response.into_result()
    }
}

struct RemoteConnection {
    device: DeviceKey,
    address: String,
    token: String,
    session: Mutex<Session>,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
}

impl RemoteConnection {
    fn call(&self, body: RequestBody) -> Result<ResponseBody> {
        let mut session = self.session.lock().map_err(lock_poisoned("remote session"))?;
        session.call(self.device, body)
    }

    /// Heartbeat once; a lapsed session is replaced by a fresh one
    fn heartbeat(&self) -> Result<()> {
        let mut session = self.session.lock().map_err(lock_poisoned("remote session"))?;
        match session.call(self.device, RequestBody::Heartbeat) {
            Ok(_) => Ok(()),
            Err(e) if e.code() == ErrorCode::TIMEOUT => {
                warn!(device = %self.device, "Session expired on daemon, reconnecting");
                *session = Session::open(self.device, &self.address, &self.token)?;
                info!(device = %self.device, client_id = session.client_id, "Reconnected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn wait_stopped(&self, interval: Duration) -> bool {
        match self.stopped.lock() {
            Ok(stopped) if *stopped => true,
            Ok(stopped) => self
                .stop_signal
                .wait_timeout(stopped, interval)
                .map(|(stopped, _)| *stopped)
                .unwrap_or(true),
            Err(_) => true,
        }
    }
}

/// TCP client for a daemon on another node
pub struct RemoteDeployer {
    connection: Arc<RemoteConnection>,
    heartbeat: Option<JoinHandle<()>>,
}

impl RemoteDeployer {
    /// Connect, authenticate and start heartbeating every `heartbeat_interval`
    pub fn connect(
        device: DeviceKey,
        address: &str,
        token: &str,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let session = Session::open(device, address, token)?;
        info!(device = %device, address, client_id = session.client_id, "Connected to daemon");
        let connection = Arc::new(RemoteConnection {
            device,
            address: address.to_string(),
            token: token.to_string(),
            session: Mutex::new(session),
            stopped: Mutex::new(false),
            stop_signal: Condvar::new(),
        });

        let weak: Weak<RemoteConnection> = Arc::downgrade(&connection);
        let heartbeat = thread::Builder::new()
            .name(format!("heartbeat-{}", device))
            .spawn(move || loop {
                let Some(connection) = weak.upgrade() else { break };
                if connection.wait_stopped(heartbeat_interval) {
                    break;
                }
                if let Err(e) = connection.heartbeat() {
                    warn!(device = %connection.device, error = %e, "Heartbeat failed");
                }
            })?;

        Ok(Self {
            connection,
            heartbeat: Some(heartbeat),
        })
    }

    /// Connect to a `devList` entry; heartbeats at a third of the daemon's
    /// timeout
    pub fn from_entry(
        node_id: u32,
        entry: &RemoteDeviceEntry,
        heartbeat_timeout: Duration,
    ) -> Result<Self> {
        Self::connect(
            DeviceKey::new(node_id, entry.device_id),
            &entry.address(),
            &entry.token,
            heartbeat_timeout / 3,
        )
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.connection.session.lock().ok().map(|s| s.client_id)
    }
}

impl Deployer for RemoteDeployer {
    fn device(&self) -> DeviceKey {
        self.connection.device
    }

    fn process(&self, body: RequestBody) -> Result<ResponseBody> {
        self.connection.call(body)
    }
}

impl Drop for RemoteDeployer {
    fn drop(&mut self) {
        if let Ok(mut stopped) = self.connection.stopped.lock() {
            *stopped = true;
        }
        self.connection.stop_signal.notify_all();
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.connection.call(RequestBody::Disconnect) {
            debug!(device = %self.connection.device, error = %e, "Disconnect failed");
        }
    }
}

/// Drives a daemon's session manager directly, for daemons hosted in the same
/// process
pub struct InProcessDeployer {
    device: DeviceKey,
    sessions: Arc<SessionManager>,
    client_id: ClientId,
}

impl InProcessDeployer {
    pub fn connect(device: DeviceKey, sessions: Arc<SessionManager>, token: &str) -> Result<Self> {
        let body = sessions.process_init_request(token, None)?;
        let client_id = expect_init(body)?;
        Ok(Self {
            device,
            sessions,
            client_id,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }
}

impl Deployer for InProcessDeployer {
    fn device(&self) -> DeviceKey {
        self.device
    }

    fn process(&self, body: RequestBody) -> Result<ResponseBody> {
        let request = Request {
            client_id: self.client_id,
            device_id: self.device.device_id,
            body,
        };
        self.sessions.process(request, None).into_result()
    }
}

impl Drop for InProcessDeployer {
    fn drop(&mut self) {
        let _ = self.sessions.process_disconnect_request(self.client_id);
    }
}
