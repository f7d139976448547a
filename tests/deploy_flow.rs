// End-to-end deployment tests: orchestrator plus in-process device daemons

use hetero_deploy::comm::{CommCounts, LoopbackComm};
use hetero_deploy::config::{ExecutorConfig, MaintenanceConfig, SessionConfig, TransportConfig};
use hetero_deploy::daemon::{DaemonServices, SessionManager};
use hetero_deploy::error::{DeployError, ErrorCode, Result};
use hetero_deploy::exchange::{QueueExchangeService, ResourceCounts};
use hetero_deploy::executor::{ExecutorManager, ThreadLauncher};
use hetero_deploy::master::{
    Deployer, DeploymentOrchestrator, ExecutorLoader, FileConstant, FixedPlanner,
    InProcessDeployer, ModelArtifact, OrchestratorConfig, SubmodelArtifact,
};
use hetero_deploy::plan::{DeployPlan, DeviceInfo, DeviceKey, DeviceType, QueueInfo, SubmodelInfo};
use hetero_deploy::protocol::{RequestBody, ResponseBody};
use hetero_deploy::registry::RouteRegistry;
use hetero_deploy::transport::QueueTransport;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOKEN: &str = "cluster-token";

fn fast_executor() -> ExecutorConfig {
    ExecutorConfig {
        event_poll_interval: Duration::from_millis(20),
        init_retries: 100,
        request_retries: 100,
        queue_depth: 4,
    }
}

fn queue(name: &str, device: DeviceKey) -> QueueInfo {
    QueueInfo {
        name: name.to_string(),
        depth: 4,
        device,
        owned_locally: true,
    }
}

fn device(key: DeviceKey) -> DeviceInfo {
    DeviceInfo {
        key,
        device_type: DeviceType::Npu,
        address: format!("10.0.0.{}:{}", key.node_id + 1, 9000 + key.device_id),
    }
}

fn submodel(device: DeviceKey, inputs: Vec<usize>, outputs: Vec<usize>) -> SubmodelInfo {
    SubmodelInfo {
        model: String::new(),
        device,
        input_queue_indices: inputs,
        output_queue_indices: outputs,
        control_input_queue_indices: vec![],
        control_output_queue_indices: vec![],
    }
}

fn named(mut info: SubmodelInfo, model: &str) -> SubmodelInfo {
    info.model = model.to_string();
    info
}

/// One local submodel (inputs=[0], outputs=[4]) and one remote submodel
/// (inputs=[1], outputs=[2]) wired `0->1` and `3->4`
fn two_node_plan() -> DeployPlan {
    let local = DeviceKey::local(0);
    let remote = DeviceKey::new(1, 0);
    DeployPlan {
        devices: vec![device(local), device(remote)],
        submodels: BTreeMap::from([
            ("head".to_string(), named(submodel(local, vec![0], vec![4]), "head")),
            ("body".to_string(), named(submodel(remote, vec![1], vec![2]), "body")),
        ]),
        queues: vec![
            queue("root_in", local),
            queue("body_in", remote),
            queue("body_out", remote),
            queue("head_in", local),
            queue("root_out", local),
        ],
        bindings: vec![(0, 1), (3, 4)],
        input_queue_indices: vec![0],
        output_queue_indices: vec![4],
        ..DeployPlan::default()
    }
}

fn artifact(names: &[&str]) -> ModelArtifact {
    ModelArtifact {
        name: "model".into(),
        submodels: names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    SubmodelArtifact {
                        data: n.as_bytes().to_vec(),
                        file_constants: vec![],
                    },
                )
            })
            .collect(),
    }
}

struct RemoteNode {
    services: Arc<DaemonServices>,
    comm: Arc<LoopbackComm>,
    sessions: Arc<SessionManager>,
}

impl RemoteNode {
    fn start() -> Self {
        let comm = Arc::new(LoopbackComm::new());
        let services = Arc::new(DaemonServices::new(
            Arc::new(QueueTransport::in_memory(TransportConfig::default())),
            comm.clone(),
            Arc::new(ThreadLauncher),
            fast_executor(),
        ));
        let sessions = Arc::new(
            SessionManager::new(TOKEN, SessionConfig::default(), Arc::clone(&services)).unwrap(),
        );
        Self {
            services,
            comm,
            sessions,
        }
    }

    fn exchange_counts(&self) -> ResourceCounts {
        self.services.exchange.resource_counts()
    }
}

/// Records every request and fails `LoadModel` when told to
struct ScriptedDeployer {
    inner: InProcessDeployer,
    fail_load: bool,
    log: Arc<Mutex<Vec<(DeviceKey, &'static str)>>>,
}

impl Deployer for ScriptedDeployer {
    fn device(&self) -> DeviceKey {
        self.inner.device()
    }

    fn process(&self, body: RequestBody) -> Result<ResponseBody> {
        self.log.lock().unwrap().push((self.device(), body.name()));
        if self.fail_load && matches!(body, RequestBody::LoadModel { .. }) {
            return Err(DeployError::Process("injected load failure".into()));
        }
        self.inner.process(body)
    }
}

struct Cluster {
    orchestrator: DeploymentOrchestrator,
    exchange: Arc<QueueExchangeService>,
    comm: Arc<LoopbackComm>,
    remotes: BTreeMap<DeviceKey, RemoteNode>,
    log: Arc<Mutex<Vec<(DeviceKey, &'static str)>>>,
}

impl Cluster {
    fn new(plan: DeployPlan, failing: &[DeviceKey]) -> Self {
        let transport = Arc::new(QueueTransport::in_memory(TransportConfig::default()));
        let exchange = Arc::new(QueueExchangeService::new(Arc::clone(&transport)));
        let comm = Arc::new(LoopbackComm::new());
        let loader = ExecutorLoader::new(ExecutorManager::new(
            0,
            transport,
            Arc::new(ThreadLauncher),
            fast_executor(),
        ));

        let remote_keys: BTreeSet<DeviceKey> = plan
            .queues
            .iter()
            .map(|q| q.device)
            .chain(plan.submodels.values().map(|s| s.device))
            .filter(|k| !k.is_local())
            .collect();

        let mut orchestrator = DeploymentOrchestrator::new(
            Arc::new(FixedPlanner::new(plan)),
            exchange.clone(),
            comm.clone(),
            Arc::new(RouteRegistry::new()),
            Arc::new(loader),
            OrchestratorConfig {
                master_address: "10.0.0.1:9100".into(),
                maintenance: MaintenanceConfig {
                    log_level: "debug".into(),
                    ..MaintenanceConfig::default()
                },
            },
        );

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut remotes = BTreeMap::new();
        for key in remote_keys {
            let node = RemoteNode::start();
            let inner = InProcessDeployer::connect(key, Arc::clone(&node.sessions), TOKEN).unwrap();
            let deployer = ScriptedDeployer {
                inner,
                fail_load: failing.contains(&key),
                log: Arc::clone(&log),
            };
            orchestrator.add_deployer(Arc::new(deployer), device(key).address);
            remotes.insert(key, node);
        }

        Self {
            orchestrator,
            exchange,
            comm,
            remotes,
            log,
        }
    }

    fn assert_released(&self) {
        assert_eq!(self.exchange.resource_counts(), ResourceCounts::default());
        assert_eq!(self.comm.counts(), CommCounts::default());
        assert!(self.orchestrator.routes().is_empty());
        for (key, node) in &self.remotes {
            assert_eq!(node.exchange_counts(), ResourceCounts::default(), "remote {}", key);
            assert_eq!(node.comm.counts(), CommCounts::default(), "remote {}", key);
            assert!(node.services.routes.is_empty(), "remote {}", key);
        }
    }

    fn requests_to(&self, key: DeviceKey) -> Vec<&'static str> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, name)| *name)
            .collect()
    }
}

#[test]
fn test_two_node_deploy_and_undeploy() {
    let cluster = Cluster::new(two_node_plan(), &[]);
    let result = cluster
        .orchestrator
        .deploy_model(&artifact(&["head", "body"]))
        .unwrap();

    let queue_ids: Vec<_> = result
        .input_queue_ids
        .iter()
        .chain(&result.output_queue_ids)
        .collect();
    assert_eq!(queue_ids.len(), 2);
    assert_ne!(queue_ids[0], queue_ids[1]);
    assert_eq!(result.route_ids.len(), 1);
    let route = cluster.orchestrator.query_route(result.route_ids[0]).unwrap();
    assert_eq!(route.bound_routes().len(), 2);

    let remote = DeviceKey::new(1, 0);
    let node = &cluster.remotes[&remote];
    assert_eq!(node.services.routes.len(), 1);
    assert_eq!(node.exchange_counts().bindings, 1);

    // pre-deploy happens before any transfer or load
    let requests = cluster.requests_to(remote);
    let pre_deploy = requests.iter().position(|r| *r == "PreDeployModel").unwrap();
    let first_load = requests.iter().position(|r| *r == "PreDownloadModel").unwrap();
    assert!(pre_deploy < first_load);
    assert_eq!(requests.iter().filter(|r| **r == "DownloadDeviceConfig").count(), 1);

    cluster.orchestrator.undeploy(result.model_id).unwrap();
    let err = cluster
        .orchestrator
        .query_route(result.route_ids[0])
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NOT_FOUND);
    cluster.assert_released();
}

#[test]
fn test_weights_transferred_once_per_device() {
    let mut weights = tempfile::NamedTempFile::new().unwrap();
    weights.write_all(&[3u8; 4096]).unwrap();

    let cluster = Cluster::new(two_node_plan(), &[]);
    let mut model = artifact(&["head", "body"]);
    model.submodels.get_mut("body").unwrap().file_constants = vec![FileConstant {
        name: "body.weights".into(),
        path: weights.path().to_path_buf(),
    }];

    let first = cluster.orchestrator.deploy_model(&model).unwrap();
    let node = &cluster.remotes[&DeviceKey::new(1, 0)];
    assert!(node.services.shared_content.is_ready("body.weights"));
    cluster.orchestrator.undeploy(first.model_id).unwrap();

    let second = cluster.orchestrator.deploy_model(&model).unwrap();
    let chunked = cluster
        .requests_to(DeviceKey::new(1, 0))
        .iter()
        .filter(|r| **r == "DownloadSharedContent")
        .count();
    // query + begin + one chunk, then a single query on re-deploy
    assert_eq!(chunked, 4);
    cluster.orchestrator.undeploy(second.model_id).unwrap();
    cluster.assert_released();
}

#[test]
fn test_out_of_range_binding_is_param_invalid() {
    let mut plan = two_node_plan();
    plan.bindings.push((0, 99));
    let cluster = Cluster::new(plan, &[]);

    let err = cluster
        .orchestrator
        .deploy_model(&artifact(&["head", "body"]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PARAM_INVALID);
    assert!(cluster.log.lock().unwrap().is_empty());
    cluster.assert_released();
}

#[test]
fn test_group_to_group_binding_always_fails_the_same_way() {
    let local = DeviceKey::local(0);
    let mut plan = two_node_plan();
    plan.queues.push(queue("fan_a", local));
    plan.queues.push(queue("fan_b", local));
    plan.groups.insert(5, vec![0]);
    plan.groups.insert(6, vec![4]);
    plan.bindings.push((5, 6));
    let cluster = Cluster::new(plan, &[]);

    for _ in 0..2 {
        let err = cluster
            .orchestrator
            .deploy_model(&artifact(&["head", "body"]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::INTERNAL_ERROR);
        cluster.assert_released();
    }
}

#[test]
fn test_failed_remote_group_rolls_back_every_group() {
    let local = DeviceKey::local(0);
    let remotes: Vec<DeviceKey> = (1..=3).map(|n| DeviceKey::new(n, 0)).collect();

    let mut plan = DeployPlan {
        devices: std::iter::once(local).chain(remotes.clone()).map(device).collect(),
        queues: vec![queue("root_in", local), queue("root_out", local)],
        input_queue_indices: vec![0],
        output_queue_indices: vec![1],
        ..DeployPlan::default()
    };
    plan.submodels
        .insert("head".into(), named(submodel(local, vec![0], vec![1]), "head"));
    for (i, key) in remotes.iter().enumerate() {
        let name = format!("part{}", i + 1);
        plan.queues.push(queue(&format!("{}_in", name), *key));
        let index = plan.queues.len() - 1;
        plan.submodels
            .insert(name.clone(), named(submodel(*key, vec![index], vec![]), &name));
    }

    let cluster = Cluster::new(plan, &[remotes[1]]);
    let err = cluster
        .orchestrator
        .deploy_model(&artifact(&["head", "part1", "part2", "part3"]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FAILED);
    assert!(err.to_string().contains("1 of 3"));

    // the healthy groups ran to completion before the rollback
    for key in [remotes[0], remotes[2]] {
        let requests = cluster.requests_to(key);
        assert!(requests.contains(&"LoadModel"), "{} never loaded", key);
        assert_eq!(requests.last(), Some(&"UnloadModel"));
    }
    assert_eq!(cluster.requests_to(remotes[1]).last(), Some(&"UnloadModel"));
    assert!(cluster.orchestrator.deployed_models().is_empty());
    cluster.assert_released();
}
