// Daemon session tests over real TCP connections

use hetero_deploy::comm::LoopbackComm;
use hetero_deploy::config::{
    ExecutorConfig, HostConfig, SessionConfig, TransportConfig, RESOURCE_DIR_ENV, RESOURCE_FILE,
};
use hetero_deploy::daemon::{ClientRegistryFile, DaemonServer, DaemonServices, SessionManager};
use hetero_deploy::error::{ErrorCode, Result};
use hetero_deploy::executor::ThreadLauncher;
use hetero_deploy::master::{Deployer, RemoteDeployer};
use hetero_deploy::plan::DeviceKey;
use hetero_deploy::protocol::{read_message, write_message, Request, RequestBody, Response, ResponseBody};
use hetero_deploy::transport::QueueTransport;
use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TOKEN: &str = "s3cret";

struct RunningDaemon {
    sessions: Arc<SessionManager>,
    address: String,
    shutdown: Arc<AtomicBool>,
    runner: Option<JoinHandle<Result<()>>>,
}

impl RunningDaemon {
    fn start(config: SessionConfig) -> Self {
        let services = Arc::new(DaemonServices::new(
            Arc::new(QueueTransport::in_memory(TransportConfig::default())),
            Arc::new(LoopbackComm::new()),
            Arc::new(ThreadLauncher),
            ExecutorConfig::default(),
        ));
        let sessions = Arc::new(SessionManager::new(TOKEN, config, services).unwrap());
        let server = DaemonServer::bind("127.0.0.1:0", Arc::clone(&sessions)).unwrap();
        let address = server.local_addr().unwrap().to_string();
        let shutdown = server.shutdown_flag();
        let runner = thread::spawn(move || server.run());
        Self {
            sessions,
            address,
            shutdown,
            runner: Some(runner),
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(runner) = self.runner.take() {
            runner.join().unwrap().unwrap();
        }
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn config(heartbeat_timeout: Duration, registry: Option<&Path>) -> SessionConfig {
    SessionConfig {
        heartbeat_timeout,
        sweep_interval: Duration::from_secs(30),
        registry_path: registry.map(Path::to_path_buf),
    }
}

fn call(stream: &mut TcpStream, client_id: u64, body: RequestBody) -> Response {
    let request = Request {
        client_id,
        device_id: 0,
        body,
    };
    write_message(stream, &request, 7).unwrap();
    let (response, id): (Response, u32) = read_message(stream).unwrap();
    assert_eq!(id, 7);
    response
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_wrong_token_over_tcp_creates_no_client() {
    let daemon = RunningDaemon::start(config(Duration::from_secs(60), None));
    let mut stream = TcpStream::connect(&daemon.address).unwrap();

    let response = call(
        &mut stream,
        0,
        RequestBody::Init {
            token: "guess".into(),
        },
    );
    assert_eq!(response.error_code, ErrorCode::AUTH_FAILED);
    assert_eq!(daemon.sessions.client_count(), 0);

    // a connection without a session may not act on any client id
    let response = call(&mut stream, 1, RequestBody::UnloadModel { root_model_id: 0 });
    assert_eq!(response.error_code, ErrorCode::AUTH_FAILED);
}

#[test]
fn test_connection_cannot_act_on_another_connections_client() {
    let daemon = RunningDaemon::start(config(Duration::from_secs(60), None));
    let mut owner = TcpStream::connect(&daemon.address).unwrap();
    let client_id = match call(
        &mut owner,
        0,
        RequestBody::Init {
            token: TOKEN.into(),
        },
    )
    .body
    {
        ResponseBody::Init { client_id, .. } => client_id,
        other => panic!("unexpected {:?}", other),
    };

    let mut stranger = TcpStream::connect(&daemon.address).unwrap();
    for body in [
        RequestBody::Disconnect,
        RequestBody::Heartbeat,
        RequestBody::UnloadModel { root_model_id: 0 },
    ] {
        let response = call(&mut stranger, client_id, body);
        assert_eq!(response.error_code, ErrorCode::AUTH_FAILED);
    }
    assert_eq!(daemon.sessions.client_ids(), vec![client_id]);

    // the owning connection still works, and a session opened by the
    // stranger does not widen what it may touch
    let response = call(&mut owner, client_id, RequestBody::Heartbeat);
    assert_eq!(response.error_code, ErrorCode::SUCCESS);
    let response = call(
        &mut stranger,
        0,
        RequestBody::Init {
            token: TOKEN.into(),
        },
    );
    assert!(matches!(response.body, ResponseBody::Init { .. }));
    let response = call(&mut stranger, client_id, RequestBody::Disconnect);
    assert_eq!(response.error_code, ErrorCode::AUTH_FAILED);
    assert_eq!(daemon.sessions.client_count(), 2);
}

#[test]
fn test_client_registry_follows_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("client.json");
    let daemon = RunningDaemon::start(config(Duration::from_secs(60), Some(&path)));

    let deployer = RemoteDeployer::connect(
        DeviceKey::new(1, 0),
        &daemon.address,
        TOKEN,
        Duration::from_secs(10),
    )
    .unwrap();
    let doc = ClientRegistryFile::load(&path).unwrap();
    assert_eq!(doc.connections.len(), 1);
    assert_eq!(doc.connections[0].ip, "127.0.0.1");

    drop(deployer);
    let doc = ClientRegistryFile::load(&path).unwrap();
    assert!(doc.connections.is_empty());
}

#[test]
fn test_deployers_from_host_resource_file() {
    let daemon = RunningDaemon::start(config(Duration::from_secs(60), None));
    let port = daemon.address.parse::<SocketAddr>().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let resource = format!(
        r#"{{
            "host": {{
                "ctrlPanel": {{"ipaddr": "127.0.0.1"}},
                "dataPanel": {{"ipaddr": "127.0.0.1", "availPorts": [9100]}}
            }},
            "mode": "cluster",
            "devList": [
                {{"deviceId": 0, "ipaddr": "127.0.0.1", "port": {port}, "token": "{TOKEN}"}},
                {{"deviceId": 1, "ipaddr": "127.0.0.1", "port": {port}, "token": "{TOKEN}"}}
            ]
        }}"#
    );
    fs::write(dir.path().join(RESOURCE_FILE), resource).unwrap();
    // no other test in this file reads the resource directory
    std::env::set_var(RESOURCE_DIR_ENV, dir.path());
    let host = HostConfig::load().unwrap();
    assert_eq!(host.data_panel_address(), "127.0.0.1:9100");

    let deployers: Vec<RemoteDeployer> = host
        .dev_list
        .iter()
        .map(|entry| RemoteDeployer::from_entry(1, entry, Duration::from_secs(30)).unwrap())
        .collect();
    assert_eq!(deployers[1].device(), DeviceKey::new(1, 1));
    assert_eq!(daemon.sessions.client_count(), 2);

    drop(deployers);
    assert_eq!(daemon.sessions.client_count(), 0);
}

#[test]
fn test_closed_connection_releases_its_clients() {
    let daemon = RunningDaemon::start(config(Duration::from_secs(60), None));
    let mut stream = TcpStream::connect(&daemon.address).unwrap();
    let response = call(
        &mut stream,
        0,
        RequestBody::Init {
            token: TOKEN.into(),
        },
    );
    assert!(matches!(response.body, ResponseBody::Init { .. }));
    assert_eq!(daemon.sessions.client_count(), 1);

    drop(stream);
    assert!(wait_for(|| daemon.sessions.client_count() == 0));
}

#[test]
fn test_lapsed_session_is_replaced_on_next_heartbeat() {
    let daemon = RunningDaemon::start(config(Duration::from_millis(50), None));
    let deployer = RemoteDeployer::connect(
        DeviceKey::new(1, 0),
        &daemon.address,
        TOKEN,
        Duration::from_millis(150),
    )
    .unwrap();
    let first = deployer.client_id().unwrap();

    assert!(wait_for(|| deployer.client_id().map_or(false, |id| id > first)));
    assert!(daemon.sessions.get_client(first).is_err());
    assert!(daemon.sessions.client_count() <= 1);
}

#[test]
fn test_shutdown_closes_every_session() {
    let mut daemon = RunningDaemon::start(config(Duration::from_secs(60), None));
    let deployer = RemoteDeployer::connect(
        DeviceKey::new(1, 0),
        &daemon.address,
        TOKEN,
        Duration::from_secs(10),
    )
    .unwrap();
    deployer
        .process(RequestBody::UnloadModel { root_model_id: 3 })
        .unwrap();
    assert_eq!(daemon.sessions.client_count(), 1);

    daemon.stop();
    assert_eq!(daemon.sessions.client_count(), 0);
    // disconnect on drop fails quietly once the daemon is gone
    drop(deployer);
}
