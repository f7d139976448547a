use super::session::SessionManager;
use crate::error::{DeployError, Result};
use crate::protocol::{
    read_message, write_message, ClientId, Request, RequestBody, Response, ResponseBody,
};
use std::collections::HashSet;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Maximum concurrent orchestrator connections
const MAX_CONNECTIONS: usize = 64;

/// Accept poll interval while no connection is pending
const ACCEPT_POLL: Duration = Duration::from_millis(10);

struct Connection {
    peer: SocketAddr,
    stream: TcpStream,
    handle: JoinHandle<()>,
}

pub struct DaemonServer {
    listener: TcpListener,
    sessions: Arc<SessionManager>,
    shutdown: Arc<AtomicBool>,
}

impl DaemonServer {
    pub fn bind(address: &str, sessions: Arc<SessionManager>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .map_err(|e| DeployError::Config(format!("cannot listen on {}: {}", address, e)))?;
        info!(address = %listener.local_addr()?, "Daemon listening");
        Ok(Self {
            listener,
            sessions,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Setting this flag ends [`DaemonServer::run`]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stop on SIGTERM or SIGINT
    pub fn register_signals(&self) -> Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&self.shutdown))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.shutdown))?;
        Ok(())
    }

    /// Accept connections until the shutdown flag is set, then close every
    /// connection and every session
    pub fn run(&self) -> Result<()> {
        self.sessions.start_eviction()?;
        self.listener.set_nonblocking(true)?;
        let mut connections: Vec<Connection> = Vec::new();

        while !self.shutdown.load(Ordering::Relaxed) {
            connections.retain(|c| !c.handle.is_finished());

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    if connections.len() >= MAX_CONNECTIONS {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        let mut writer = BufWriter::new(&stream);
                        let rejected = Response::error(&DeployError::Internal(
                            "connection limit reached".into(),
                        ));
                        let _ = write_message(&mut writer, &rejected, 0).and_then(|()| {
                            writer.flush()?;
                            Ok(())
                        });
                        continue;
                    }
                    match self.spawn_connection(stream, peer) {
                        Ok(connection) => connections.push(connection),
                        Err(e) => error!(peer = %peer, error = %e, "Failed to start connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    thread::sleep(ACCEPT_POLL * 10);
                }
            }
        }

        info!(connections = connections.len(), "Shutting down daemon");
        for connection in connections {
            let _ = connection.stream.shutdown(Shutdown::Both);
            if connection.handle.join().is_err() {
                warn!(peer = %connection.peer, "Connection thread panicked");
            }
        }
        self.sessions.shutdown();
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<Connection> {
        let control = stream.try_clone()?;
        let sessions = Arc::clone(&self.sessions);
        let handle = thread::Builder::new()
            .name(format!("conn-{}", peer))
            .spawn(move || serve_connection(stream, peer, sessions))?;
        debug!(peer = %peer, "Connection accepted");
        Ok(Connection {
            peer,
            stream: control,
            handle,
        })
    }
}

fn serve_connection(stream: TcpStream, peer: SocketAddr, sessions: Arc<SessionManager>) {
    let _ = stream.set_nodelay(true);
    let mut reader = match stream.try_clone() {
        Ok(read_half) => BufReader::new(read_half),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to split connection");
            return;
        }
    };
    let mut writer = BufWriter::new(stream);
    // clients this connection created and has not disconnected
    let mut owned: HashSet<ClientId> = HashSet::new();

    loop {
        let (request, message_id) = match read_message::<_, Request>(&mut reader) {
            Ok(message) => message,
            Err(DeployError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Connection read ended");
                break;
            }
        };

        let disconnecting = matches!(request.body, RequestBody::Disconnect)
            .then_some(request.client_id);
        let authorized =
            matches!(request.body, RequestBody::Init { .. }) || owned.contains(&request.client_id);
        let response = if authorized {
            sessions.process(request, Some(peer))
        } else {
            warn!(
                peer = %peer,
                client_id = request.client_id,
                request = request.body.name(),
                "Request for a client this connection did not initialize"
            );
            Response::from_result(Err(DeployError::Auth(format!(
                "client {} does not belong to this connection",
                request.client_id
            ))))
        };
        if let ResponseBody::Init { client_id, .. } = response.body {
            owned.insert(client_id);
        }
        if let Some(client_id) = disconnecting {
            owned.remove(&client_id);
        }

        let sent = write_message(&mut writer, &response, message_id)
            .and_then(|()| writer.flush().map_err(DeployError::from));
        if let Err(e) = sent {
            warn!(peer = %peer, error = %e, "Failed to send response");
            break;
        }
    }

    for client_id in owned {
        if sessions.close_client(client_id).is_ok() {
            info!(peer = %peer, client_id, "Closed client left behind by dropped connection");
        }
    }
    debug!(peer = %peer, "Connection closed");
}
