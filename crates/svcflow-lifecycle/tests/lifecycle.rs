//! End-to-end lifecycle tests against the simulated backend.
//!
//! Every test wires a `LifecycleManager` to an in-memory store, a
//! `LocalBus` and a `SimulatedBackend` whose transitions are published on
//! that bus, so waits resolve the same way they do in production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use svcflow_backend::{
    BackendResult, ComputeBackend, LcmState, NetworkSpec, NodeAction, NodeSpec, NodeState,
    SimulatedBackend, VmState,
};
use svcflow_core::{FlowConfig, NetworkId, NodeId};
use svcflow_events::{LocalBus, TcpEventSource};
use svcflow_lifecycle::{LifecycleAction, LifecycleError, LifecycleManager};
use svcflow_state::{
    NetworkRef, NodeStatus, Role, RoleState, ScaleDirection, Service, ServiceId, ServicePool,
    ServiceState, ServiceStore, Strategy,
};

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    manager: LifecycleManager,
    backend: SimulatedBackend,
}

fn test_config() -> FlowConfig {
    let mut config = FlowConfig::default();
    config.events.wait_timeout_secs = 1;
    config.dispatcher.concurrency = 4;
    config.lifecycle.default_cooldown_secs = 1;
    config
}

fn harness_with(delay_ms: u64, tweak: impl FnOnce(&mut FlowConfig)) -> Harness {
    let bus = Arc::new(LocalBus::default());
    let backend =
        SimulatedBackend::new(Duration::from_millis(delay_ms)).with_hook(bus.transition_hook());
    let mut config = test_config();
    tweak(&mut config);

    let pool = ServicePool::new(ServiceStore::open_in_memory().unwrap());
    let manager = LifecycleManager::new(pool, Arc::new(backend.clone()), bus, &config);
    manager.start();
    Harness { manager, backend }
}

fn harness() -> Harness {
    harness_with(20, |_| {})
}

impl Harness {
    fn create(&self, strategy: Strategy, roles: Vec<Role>) -> ServiceId {
        self.manager
            .create_service(Service::new("app", strategy, roles))
            .unwrap()
            .id
    }

    fn get(&self, id: ServiceId) -> Service {
        self.manager.service(id).unwrap().expect("service exists")
    }

    /// Overwrite the stored document, as a previous process would have
    /// left it.
    fn store(&self, svc: &Service) {
        self.manager.pool().store().put_service(svc).unwrap();
    }

    async fn wait_for_state(&self, id: ServiceId, state: ServiceState) -> Service {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let svc = self.get(id);
            if svc.state == state {
                return svc;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("service {id} stuck in {} waiting for {state}", svc.state);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_until_gone(&self, id: ServiceId) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.manager.service(id).unwrap().is_some() {
            assert!(tokio::time::Instant::now() < deadline, "service {id} never removed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn deploy_running(&self, strategy: Strategy, roles: Vec<Role>) -> ServiceId {
        let id = self.create(strategy, roles);
        self.manager
            .trigger(LifecycleAction::Deploy { service_id: id })
            .unwrap();
        self.wait_for_state(id, ServiceState::Running).await;
        id
    }

    /// Deploy a node straight on the backend and let it settle.
    async fn backend_node(&self, role: &str) -> NodeId {
        let node = self
            .backend
            .deploy(&NodeSpec::new(1, role, 0, json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        node
    }
}

fn log_contains(svc: &Service, needle: &str) -> bool {
    svc.log.iter().any(|entry| entry.message.contains(needle))
}

// ── Deploy ─────────────────────────────────────────────────────────

#[tokio::test]
async fn straight_deploys_parent_role_first() {
    let h = harness_with(200, |_| {});
    let id = h.create(
        Strategy::Straight,
        vec![Role::new("a", 2), Role::new("b", 1).with_parents(&["a"])],
    );
    h.manager
        .trigger(LifecycleAction::Deploy { service_id: id })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let deployed = h.backend.deployed();
    assert_eq!(deployed.len(), 2, "b must wait for a");
    assert!(deployed.iter().all(|&n| h.backend.node_role(n).as_deref() == Some("a")));

    let svc = h.wait_for_state(id, ServiceState::Running).await;
    let deployed = h.backend.deployed();
    assert_eq!(deployed.len(), 3);
    assert_eq!(h.backend.node_role(deployed[2]).as_deref(), Some("b"));
    assert!(svc.roles.iter().all(|r| r.state == RoleState::Running));
    assert!(
        svc.roles
            .iter()
            .flat_map(|r| r.nodes.iter())
            .all(|n| n.status == NodeStatus::Running)
    );
}

#[tokio::test]
async fn straight_moves_past_a_role_with_nothing_to_deploy() {
    let h = harness();
    let id = h.create(
        Strategy::Straight,
        vec![Role::new("a", 0), Role::new("b", 1).with_parents(&["a"])],
    );
    h.manager
        .trigger(LifecycleAction::Deploy { service_id: id })
        .unwrap();

    let svc = h.wait_for_state(id, ServiceState::Running).await;
    assert_eq!(h.backend.deployed().len(), 1);
    assert_eq!(svc.role("a").unwrap().state, RoleState::Running);
    assert_eq!(svc.role("b").unwrap().live_count(), 1);
}

#[tokio::test]
async fn parallel_dispatches_every_role_at_once() {
    let h = harness_with(300, |_| {});
    let id = h.create(
        Strategy::Parallel,
        vec![Role::new("a", 2), Role::new("b", 1)],
    );

    h.manager.deploy(id).await.unwrap();
    assert_eq!(h.backend.deployed().len(), 3);
    let svc = h.get(id);
    assert_eq!(svc.state, ServiceState::Deploying);
    assert!(svc.roles.iter().all(|r| r.state == RoleState::Deploying));

    h.wait_for_state(id, ServiceState::Running).await;
}

#[tokio::test]
async fn network_failure_fails_deploy() {
    let h = harness();
    let svc = Service::new("app", Strategy::Parallel, vec![Role::new("web", 1)]).with_networks(
        vec![NetworkRef {
            name: "private".into(),
            template: json!({}),
            network_id: None,
        }],
    );
    let id = h.manager.create_service(svc).unwrap().id;
    h.backend.fail_networks(true);

    let err = h.manager.deploy(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Backend(_)));

    let svc = h.get(id);
    assert_eq!(svc.state, ServiceState::FailedDeploying);
    assert!(log_contains(&svc, "Error creating networks"));
    assert!(h.backend.deployed().is_empty());
}

#[tokio::test]
async fn boot_failure_then_recover() {
    let h = harness();
    h.backend.boot_failure_for("web");
    let id = h.create(Strategy::Parallel, vec![Role::new("web", 2)]);
    h.manager
        .trigger(LifecycleAction::Deploy { service_id: id })
        .unwrap();

    let svc = h.wait_for_state(id, ServiceState::FailedDeploying).await;
    let role = svc.role("web").unwrap();
    assert_eq!(role.state, RoleState::FailedDeploying);
    assert!(!role.node_ids_with(NodeStatus::Failed).is_empty());
    let failed = role.node_ids_with(NodeStatus::Failed);

    h.backend.heal();
    h.manager.recover(id).await.unwrap();
    let svc = h.wait_for_state(id, ServiceState::Running).await;

    let role = svc.role("web").unwrap();
    assert_eq!(role.live_count(), 2);
    assert!(role.node_ids().iter().all(|n| !failed.contains(n)));
    for node in failed {
        assert!(h.backend.shutdowns().contains(&(node, true)));
    }
}

#[tokio::test]
async fn bus_failure_fails_the_wait() {
    // Bind then drop to get a port nobody publishes on.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let backend = SimulatedBackend::new(Duration::from_millis(20));
    let pool = ServicePool::new(ServiceStore::open_in_memory().unwrap());
    let manager = LifecycleManager::new(
        pool,
        Arc::new(backend.clone()),
        Arc::new(TcpEventSource::new(addr)),
        &test_config(),
    );
    manager.start();
    let h = Harness { manager, backend };

    let id = h.create(Strategy::Parallel, vec![Role::new("web", 1)]);
    h.manager
        .trigger(LifecycleAction::Deploy { service_id: id })
        .unwrap();

    let svc = h.wait_for_state(id, ServiceState::FailedDeploying).await;
    assert_eq!(svc.role("web").unwrap().state, RoleState::FailedDeploying);
    assert!(log_contains(&svc, "cannot connect to event publisher"));
}

// ── Undeploy ───────────────────────────────────────────────────────

#[tokio::test]
async fn undeploy_releases_nodes_and_networks() {
    let h = harness();
    let svc = Service::new(
        "app",
        Strategy::Straight,
        vec![Role::new("db", 1), Role::new("web", 2).with_parents(&["db"])],
    )
    .with_networks(vec![NetworkRef {
        name: "private".into(),
        template: json!({"vlan": 7}),
        network_id: None,
    }]);
    let id = h.manager.create_service(svc).unwrap().id;
    h.manager
        .trigger(LifecycleAction::Deploy { service_id: id })
        .unwrap();
    let svc = h.wait_for_state(id, ServiceState::Running).await;
    let network: NetworkId = svc.networks[0].network_id.expect("network created");
    assert_eq!(h.backend.networks(), vec![network]);

    h.manager
        .trigger(LifecycleAction::Undeploy { service_id: id })
        .unwrap();
    let svc = h.wait_for_state(id, ServiceState::Done).await;

    assert_eq!(h.backend.node_count(), 0);
    assert_eq!(h.backend.deleted_networks(), vec![network]);
    assert!(svc.networks[0].network_id.is_none());
    assert!(svc.roles.iter().all(|r| r.state == RoleState::Done && r.nodes.is_empty()));
    assert!(h.backend.shutdowns().iter().all(|&(_, hard)| !hard));
}

#[tokio::test]
async fn straight_undeploys_children_first() {
    let h = harness_with(200, |_| {});
    let id = h
        .deploy_running(
            Strategy::Straight,
            vec![Role::new("db", 1), Role::new("web", 2).with_parents(&["db"])],
        )
        .await;
    let svc = h.get(id);
    let db_nodes = svc.role("db").unwrap().node_ids();
    let web_nodes = svc.role("web").unwrap().node_ids();

    h.manager
        .trigger(LifecycleAction::Undeploy { service_id: id })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let svc = h.get(id);
    assert_eq!(svc.role("web").unwrap().state, RoleState::Undeploying);
    assert_eq!(svc.role("db").unwrap().state, RoleState::Running);

    h.wait_for_state(id, ServiceState::Done).await;
    let shut: Vec<NodeId> = h.backend.shutdowns().iter().map(|&(n, _)| n).collect();
    assert_eq!(shut.len(), 3);
    let (first, last) = shut.split_at(2);
    assert!(first.iter().all(|n| web_nodes.contains(n)));
    assert_eq!(last, db_nodes.as_slice());
}

#[tokio::test]
async fn straight_undeploy_skips_roles_without_nodes() {
    let h = harness();
    let id = h.create(
        Strategy::Straight,
        vec![Role::new("a", 1), Role::new("b", 1).with_parents(&["a"])],
    );
    let node = h.backend_node("a").await;

    // What a straight deploy leaves behind when `b` fails to allocate.
    let mut svc = h.get(id);
    svc.state = ServiceState::FailedDeploying;
    svc.roles[0].state = RoleState::Running;
    svc.roles[0].add_nodes(&[node], NodeStatus::Running);
    svc.roles[1].state = RoleState::FailedDeploying;
    h.store(&svc);

    h.manager
        .trigger(LifecycleAction::Undeploy { service_id: id })
        .unwrap();
    let svc = h.wait_for_state(id, ServiceState::Done).await;
    assert_eq!(h.backend.shutdowns(), vec![(node, false)]);
    assert!(svc.roles.iter().all(|r| r.state == RoleState::Done));
}

#[tokio::test]
async fn failed_shutdown_fails_undeploy_until_recovered() {
    let h = harness_with(300, |_| {});
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    let node = h.get(id).roles[0].node_ids()[0];

    h.manager.undeploy(id).await.unwrap();
    h.backend
        .set_node_state(node, NodeState::new(VmState::Active, LcmState::EpilogFailure));

    let svc = h.wait_for_state(id, ServiceState::FailedUndeploying).await;
    let role = svc.role("web").unwrap();
    assert_eq!(role.state, RoleState::FailedUndeploying);
    assert_eq!(role.node_ids_with(NodeStatus::Failed), vec![node]);
    assert!(log_contains(&svc, "Error undeploying role web"));

    h.manager.recover(id).await.unwrap();
    assert_eq!(h.get(id).state, ServiceState::Undeploying);
    h.manager
        .trigger(LifecycleAction::Undeploy { service_id: id })
        .unwrap();
    h.wait_for_state(id, ServiceState::Done).await;
    assert_eq!(h.backend.node_count(), 0);
}

// ── Scale ──────────────────────────────────────────────────────────

#[tokio::test]
async fn scale_up_goes_through_cooldown() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 2)]).await;
    assert_eq!(h.backend.deployed().len(), 2);

    h.manager.scale(id, "web", 4, false).await.unwrap();
    let svc = h.get(id);
    assert_eq!(svc.state, ServiceState::Scaling);
    assert_eq!(svc.role("web").unwrap().scale_direction, Some(ScaleDirection::Up));

    h.wait_for_state(id, ServiceState::Cooldown).await;
    let svc = h.wait_for_state(id, ServiceState::Running).await;

    assert_eq!(h.backend.deployed().len(), 4);
    let role = svc.role("web").unwrap();
    assert_eq!(role.cardinality, 4);
    assert_eq!(role.state, RoleState::Running);
    assert_eq!(role.scale_direction, None);
    assert_eq!(role.node_ids_with(NodeStatus::Running).len(), 4);
}

#[tokio::test]
async fn scale_down_removes_newest_nodes() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 4)]).await;
    let deployed = h.backend.deployed();

    h.manager.scale(id, "web", 2, false).await.unwrap();
    h.wait_for_state(id, ServiceState::Cooldown).await;
    let svc = h.wait_for_state(id, ServiceState::Running).await;

    let mut shut: Vec<NodeId> = h.backend.shutdowns().iter().map(|&(n, _)| n).collect();
    shut.sort_unstable();
    assert_eq!(shut, deployed[2..].to_vec());

    let role = svc.role("web").unwrap();
    assert_eq!(role.node_ids(), deployed[..2].to_vec());
    assert_eq!(role.scale_direction, None);
}

#[tokio::test]
async fn scale_down_ignores_failed_refs() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 4)]).await;
    let deployed = h.backend.deployed();

    let mut svc = h.get(id);
    svc.roles[0].add_nodes(&[9_999], NodeStatus::Failed);
    h.store(&svc);

    h.manager.scale(id, "web", 2, false).await.unwrap();
    let svc = h.wait_for_state(id, ServiceState::Running).await;

    let role = svc.role("web").unwrap();
    assert_eq!(role.cardinality, 2);
    assert_eq!(role.live_count(), 2);
    let mut shut: Vec<NodeId> = h.backend.shutdowns().iter().map(|&(n, _)| n).collect();
    shut.sort_unstable();
    assert_eq!(shut, deployed[2..].to_vec());
}

#[tokio::test]
async fn scale_to_same_cardinality_is_noop() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 2)]).await;
    let before = h.get(id);

    h.manager.scale(id, "web", 2, false).await.unwrap();
    assert_eq!(h.get(id), before);
}

#[tokio::test]
async fn scale_failure_then_recover() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    h.backend.fail_deploys_for("web");

    assert!(h.manager.scale(id, "web", 3, false).await.is_err());
    let svc = h.get(id);
    assert_eq!(svc.state, ServiceState::FailedScaling);
    assert_eq!(svc.role("web").unwrap().state, RoleState::FailedScaling);

    h.backend.heal();
    h.manager.recover(id).await.unwrap();
    let svc = h.wait_for_state(id, ServiceState::Running).await;
    assert_eq!(svc.role("web").unwrap().live_count(), 3);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let h = harness();
    let id = h.create(Strategy::Parallel, vec![Role::new("web", 1)]);

    let err = h.manager.scale(id, "web", 3, false).await.unwrap_err();
    assert_eq!(err.to_string(), format!("cannot scale service {id} in state PENDING"));
    let err = h.manager.scale(id, "web", 3, true).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }));

    h.manager.undeploy(id).await.unwrap();
    assert_eq!(h.get(id).state, ServiceState::Done);
    let err = h.manager.deploy(id).await.unwrap_err();
    assert_eq!(err.to_string(), format!("cannot deploy service {id} in state DONE"));

    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    let err = h.manager.scale(id, "db", 3, false).await.unwrap_err();
    assert!(matches!(err, LifecycleError::RoleNotFound { .. }));
}

// ── Recover and catch-up ───────────────────────────────────────────

#[tokio::test]
async fn recover_rejected_when_running() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    let before = h.get(id);

    let err = h.manager.recover(id).await.unwrap_err();
    assert_eq!(err.to_string(), "recover not available for state RUNNING");
    assert_eq!(h.get(id), before);
}

#[tokio::test]
async fn recover_cooldown_skips_the_wait() {
    let h = harness_with(20, |c| c.lifecycle.default_cooldown_secs = 600);
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;

    h.manager.scale(id, "web", 2, false).await.unwrap();
    h.wait_for_state(id, ServiceState::Cooldown).await;

    h.manager.recover(id).await.unwrap();
    let svc = h.get(id);
    assert_eq!(svc.state, ServiceState::Running);
    assert_eq!(svc.role("web").unwrap().state, RoleState::Running);

    tokio::time::timeout(Duration::from_secs(2), h.manager.events().wait_idle())
        .await
        .expect("cooldown wait cancelled");
    assert_eq!(h.get(id).state, ServiceState::Running);
}

#[tokio::test]
async fn recover_warning_calls_backend_hook() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 2)]).await;

    let mut svc = h.get(id);
    svc.state = ServiceState::Warning;
    svc.roles[0].state = RoleState::Warning;
    h.store(&svc);

    h.manager.recover(id).await.unwrap();
    let mut recovered = h.backend.recovered();
    recovered.sort_unstable();
    assert_eq!(recovered, svc.roles[0].node_ids());
    assert_eq!(h.get(id).state, ServiceState::Warning);
}

#[tokio::test]
async fn catch_up_recovers_failed_deploy() {
    let h = harness();
    let id = h.create(
        Strategy::Parallel,
        vec![Role::new("db", 1), Role::new("web", 1)],
    );

    let db_node = h.backend_node("db").await;
    h.backend.boot_failure_for("web");
    let bad_node = h.backend_node("web").await;
    h.backend.heal();

    let mut svc = h.get(id);
    svc.state = ServiceState::FailedDeploying;
    svc.roles[0].state = RoleState::Running;
    svc.roles[0].add_nodes(&[db_node], NodeStatus::Running);
    svc.roles[1].state = RoleState::FailedDeploying;
    svc.roles[1].add_nodes(&[bad_node], NodeStatus::Failed);
    h.store(&svc);

    assert_eq!(h.manager.catch_up().await.unwrap(), 1);
    let svc = h.wait_for_state(id, ServiceState::Running).await;

    assert_eq!(svc.role("db").unwrap().node_ids(), vec![db_node]);
    assert!(!h.backend.shutdowns().iter().any(|&(n, _)| n == db_node));
    assert!(h.backend.shutdowns().contains(&(bad_node, true)));

    let web = svc.role("web").unwrap();
    assert_eq!(web.state, RoleState::Running);
    assert_eq!(web.nodes.len(), 1);
    assert_ne!(web.nodes[0].deploy_id, bad_node);
}

#[tokio::test]
async fn catch_up_resumes_interrupted_deploy() {
    let h = harness();
    let id = h.create(Strategy::Parallel, vec![Role::new("web", 1)]);
    let node = h.backend_node("web").await;

    let mut svc = h.get(id);
    svc.state = ServiceState::Deploying;
    svc.roles[0].state = RoleState::Deploying;
    svc.roles[0].add_nodes(&[node], NodeStatus::Deploying);
    h.store(&svc);

    assert_eq!(h.manager.catch_up().await.unwrap(), 1);
    let svc = h.wait_for_state(id, ServiceState::Running).await;

    assert_eq!(h.backend.deployed(), vec![node], "no extra node deployed");
    assert_eq!(svc.roles[0].node_ids_with(NodeStatus::Running), vec![node]);
    assert!(log_contains(&svc, "Operation interrupted"));
}

#[tokio::test]
async fn catch_up_reissues_interrupted_delete() {
    let h = harness();
    let id = h.create(Strategy::Parallel, vec![Role::new("web", 1)]);
    let node = h.backend_node("web").await;

    let mut svc = h.get(id);
    svc.state = ServiceState::Deleting;
    svc.roles[0].state = RoleState::Deleting;
    svc.roles[0].add_nodes(&[node], NodeStatus::ShuttingDown);
    h.store(&svc);

    assert_eq!(h.manager.catch_up().await.unwrap(), 1);
    h.wait_until_gone(id).await;
    assert_eq!(h.backend.node_count(), 0);
}

#[tokio::test]
async fn catch_up_leaves_settled_services_alone() {
    let h = harness();
    let running = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    let pending = h.create(Strategy::Parallel, vec![Role::new("web", 1)]);

    let mut failed = h.get(pending);
    failed.state = ServiceState::FailedDeleting;
    h.store(&failed);

    let writes = h.manager.pool().store().write_count();
    assert_eq!(h.manager.catch_up().await.unwrap(), 0);
    assert_eq!(h.get(running).state, ServiceState::Running);
    assert_eq!(h.get(pending).state, ServiceState::FailedDeleting);
    assert_eq!(h.manager.pool().store().write_count(), writes, "nothing rewritten");
}

#[tokio::test]
async fn catch_up_finishes_interrupted_undeploy() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    let node = h.get(id).roles[0].node_ids()[0];

    // The shutdown went out, the process died before the wait reported.
    h.backend.shutdown(node, false).await.unwrap();
    let mut svc = h.get(id);
    svc.state = ServiceState::Undeploying;
    svc.roles[0].state = RoleState::Undeploying;
    svc.roles[0].mark_nodes(&[node], NodeStatus::ShuttingDown);
    h.store(&svc);

    assert_eq!(h.manager.catch_up().await.unwrap(), 2);
    let svc = h.wait_for_state(id, ServiceState::Done).await;
    assert!(log_contains(&svc, "Operation interrupted while UNDEPLOYING"));
    assert!(log_contains(&svc, "Recovering undeployment"));
    assert!(svc.roles[0].nodes.is_empty());
    assert_eq!(h.backend.node_count(), 0);
}

#[tokio::test]
async fn catch_up_resumes_interrupted_scaling() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    let extra = h.backend_node("web").await;

    let mut svc = h.get(id);
    svc.state = ServiceState::Scaling;
    svc.roles[0].state = RoleState::Scaling;
    svc.roles[0].cardinality = 2;
    svc.roles[0].scale_direction = Some(ScaleDirection::Up);
    svc.roles[0].add_nodes(&[extra], NodeStatus::Deploying);
    h.store(&svc);

    assert_eq!(h.manager.catch_up().await.unwrap(), 1);

    let svc = h.wait_for_state(id, ServiceState::Running).await;
    assert_eq!(h.backend.deployed().len(), 2, "no extra node deployed");
    let role = svc.role("web").unwrap();
    assert_eq!(role.node_ids_with(NodeStatus::Running).len(), 2);
    assert_eq!(role.scale_direction, None);
    assert!(log_contains(&svc, "Operation interrupted while SCALING"));
}

#[tokio::test]
async fn restart_resumes_deploy_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.redb");
    let bus = Arc::new(LocalBus::default());
    let backend = SimulatedBackend::new(Duration::from_millis(20)).with_hook(bus.transition_hook());

    // The first process dies right after dispatching: its wait workers
    // never started, so the deploy is left in flight on disk.
    let id = {
        let pool = ServicePool::new(ServiceStore::open(&path).unwrap());
        let manager =
            LifecycleManager::new(pool, Arc::new(backend.clone()), bus.clone(), &test_config());
        let svc = Service::new("app", Strategy::Parallel, vec![Role::new("web", 2)]);
        let id = manager.create_service(svc).unwrap().id;
        manager.deploy(id).await.unwrap();
        assert_eq!(manager.service(id).unwrap().unwrap().state, ServiceState::Deploying);
        manager.shutdown().await;
        id
    };

    let pool = ServicePool::new(ServiceStore::open(&path).unwrap());
    let manager = LifecycleManager::new(pool, Arc::new(backend.clone()), bus, &test_config());
    assert_eq!(manager.catch_up().await.unwrap(), 1);
    manager.start();

    let h = Harness { manager, backend };
    let svc = h.wait_for_state(id, ServiceState::Running).await;
    assert_eq!(h.backend.deployed().len(), 2);
    assert_eq!(svc.roles[0].node_ids_with(NodeStatus::Running).len(), 2);
}

// ── Delete and metadata ────────────────────────────────────────────

#[tokio::test]
async fn delete_removes_service() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 2)]).await;

    h.manager
        .trigger(LifecycleAction::Delete { service_id: id })
        .unwrap();
    h.wait_until_gone(id).await;

    assert_eq!(h.backend.node_count(), 0);
    let shutdowns = h.backend.shutdowns();
    assert_eq!(shutdowns.len(), 2);
    assert!(shutdowns.iter().all(|&(_, hard)| !hard));
}

#[tokio::test]
async fn forced_deletion_uses_hard_shutdown() {
    let h = harness_with(20, |c| c.lifecycle.force_deletion = true);
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 2)]).await;

    h.manager.delete(id).await.unwrap();
    h.wait_until_gone(id).await;
    assert!(h.backend.shutdowns().iter().all(|&(_, hard)| hard));
}

#[tokio::test]
async fn delete_failure_is_retryable() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    h.backend.fail_shutdowns(true);

    assert!(h.manager.delete(id).await.is_err());
    assert_eq!(h.get(id).state, ServiceState::FailedDeleting);

    h.backend.heal();
    h.manager.delete(id).await.unwrap();
    h.wait_until_gone(id).await;
}

#[tokio::test]
async fn chown_rolls_back_on_failure() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 3)]).await;
    let nodes = h.get(id).roles[0].node_ids();
    h.backend.fail_chown_for(nodes[2]);

    assert!(h.manager.chown(id, 7, 8).await.is_err());
    assert_eq!(h.backend.node_owner(nodes[0]), Some((0, 0)));
    assert_eq!(h.backend.node_owner(nodes[1]), Some((0, 0)));
    let svc = h.get(id);
    assert_eq!((svc.owner.uid, svc.owner.gid), (0, 0));
    assert!(log_contains(&svc, "Error changing owner"));

    h.backend.heal();
    h.manager.chown(id, 7, 8).await.unwrap();
    assert!(nodes.iter().all(|&n| h.backend.node_owner(n) == Some((7, 8))));
    assert_eq!(h.get(id).owner.uid, 7);
}

#[tokio::test]
async fn chmod_and_rename() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 2)]).await;

    h.manager.chmod(id, "640").await.unwrap();
    h.manager.rename(id, "shop").await.unwrap();

    let svc = h.get(id);
    assert_eq!(svc.owner.permissions, "640");
    assert_eq!(svc.name, "shop");
    assert!(
        svc.roles[0]
            .node_ids()
            .iter()
            .all(|&n| h.backend.node_permissions(n).as_deref() == Some("640"))
    );
}

#[tokio::test]
async fn chgrp_keeps_the_owner() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 2)]).await;
    let nodes = h.get(id).roles[0].node_ids();

    h.manager.chown(id, 7, 8).await.unwrap();
    h.manager
        .trigger(LifecycleAction::Chgrp { service_id: id, gid: 9 })
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.get(id).owner.gid != 9 {
        assert!(tokio::time::Instant::now() < deadline, "group never changed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let svc = h.get(id);
    assert_eq!(svc.owner.uid, 7);
    assert!(nodes.iter().all(|&n| h.backend.node_owner(n) == Some((7, 9))));
    assert!(log_contains(&svc, "Group changed to 9"));
}

#[tokio::test]
async fn sched_action_spreads_batches_over_time() {
    let h = harness();
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 3)]).await;
    let nodes = h.get(id).roles[0].node_ids();

    h.manager
        .sched_action(id, "web", NodeAction::Reboot, Some(30), Some(2))
        .await
        .unwrap();

    assert_eq!(
        h.backend.scheduled(),
        vec![
            (nodes[0], NodeAction::Reboot, Duration::ZERO),
            (nodes[1], NodeAction::Reboot, Duration::ZERO),
            (nodes[2], NodeAction::Reboot, Duration::from_secs(30)),
        ]
    );
    let svc = h.get(id);
    assert_eq!(svc.state, ServiceState::Running);
    assert!(log_contains(&svc, "Action reboot scheduled on 3 nodes of role web"));
}

#[tokio::test]
async fn sched_action_defaults() {
    let h = harness_with(20, |c| {
        c.lifecycle.action_period_secs = 5;
        c.lifecycle.action_number = 1;
    });
    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 2)]).await;

    h.manager
        .sched_action(id, "web", NodeAction::PoweroffHard, None, None)
        .await
        .unwrap();
    let delays: Vec<Duration> = h.backend.scheduled().iter().map(|&(_, _, d)| d).collect();
    assert_eq!(delays, vec![Duration::ZERO, Duration::from_secs(5)]);

    // A period without a batch size puts every node in one batch.
    h.manager
        .sched_action(id, "web", NodeAction::Resume, Some(10), None)
        .await
        .unwrap();
    let delays: Vec<Duration> = h.backend.scheduled()[2..].iter().map(|&(_, _, d)| d).collect();
    assert_eq!(delays, vec![Duration::ZERO, Duration::ZERO]);
}

#[tokio::test]
async fn sched_action_rejections() {
    let h = harness();
    let pending = h.create(Strategy::Parallel, vec![Role::new("web", 1)]);
    let err = h
        .manager
        .sched_action(pending, "web", NodeAction::Stop, None, None)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("cannot sched_action service {pending} in state PENDING")
    );

    let id = h.deploy_running(Strategy::Parallel, vec![Role::new("web", 1)]).await;
    let err = h
        .manager
        .sched_action(id, "web", NodeAction::Stop, Some(10), Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidRequest(_)));

    h.backend.fail_scheduling(true);
    assert!(
        h.manager
            .sched_action(id, "web", NodeAction::Stop, None, None)
            .await
            .is_err()
    );
    let svc = h.get(id);
    assert_eq!(svc.state, ServiceState::Running);
    assert!(log_contains(&svc, "Error scheduling stop"));
    assert!(h.backend.scheduled().is_empty());
}

// ── Single flight ──────────────────────────────────────────────────

/// Slows `deploy` down and records how many calls overlap, per service
/// and overall.
#[derive(Clone)]
struct Tracking {
    inner: SimulatedBackend,
    active: Arc<Mutex<HashMap<ServiceId, usize>>>,
    peak_per_service: Arc<AtomicUsize>,
    peak_total: Arc<AtomicUsize>,
}

#[async_trait]
impl ComputeBackend for Tracking {
    async fn deploy(&self, spec: &NodeSpec) -> BackendResult<NodeId> {
        {
            let mut active = self.active.lock().unwrap();
            let n = active.entry(spec.service_id).or_insert(0);
            *n += 1;
            self.peak_per_service.fetch_max(*n, Ordering::SeqCst);
            let total: usize = active.values().sum();
            self.peak_total.fetch_max(total, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = self.inner.deploy(spec).await;
        *self.active.lock().unwrap().get_mut(&spec.service_id).unwrap() -= 1;
        result
    }

    async fn shutdown(&self, node: NodeId, hard: bool) -> BackendResult<()> {
        self.inner.shutdown(node, hard).await
    }

    async fn query(&self, node: NodeId) -> BackendResult<NodeState> {
        self.inner.query(node).await
    }

    async fn create_network(&self, spec: &NetworkSpec) -> BackendResult<NetworkId> {
        self.inner.create_network(spec).await
    }

    async fn delete_network(&self, network: NetworkId) -> BackendResult<()> {
        self.inner.delete_network(network).await
    }

    async fn chown(&self, node: NodeId, uid: u32, gid: u32) -> BackendResult<()> {
        self.inner.chown(node, uid, gid).await
    }

    async fn chmod(&self, node: NodeId, octet: &str) -> BackendResult<()> {
        self.inner.chmod(node, octet).await
    }

    async fn schedule_action(
        &self,
        node: NodeId,
        action: NodeAction,
        after: Duration,
    ) -> BackendResult<()> {
        self.inner.schedule_action(node, action, after).await
    }
}

#[tokio::test]
async fn one_action_per_service_at_a_time() {
    let bus = Arc::new(LocalBus::default());
    let sim = SimulatedBackend::new(Duration::from_millis(20)).with_hook(bus.transition_hook());
    let tracking = Tracking {
        inner: sim,
        active: Arc::default(),
        peak_per_service: Arc::default(),
        peak_total: Arc::default(),
    };
    let pool = ServicePool::new(ServiceStore::open_in_memory().unwrap());
    let manager =
        LifecycleManager::new(pool, Arc::new(tracking.clone()), bus, &test_config());
    manager.start();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let svc = Service::new("app", Strategy::Parallel, vec![Role::new("web", 2)]);
        let id = manager.create_service(svc).unwrap().id;
        ids.push(id);
    }
    for &id in &ids {
        manager.trigger(LifecycleAction::Deploy { service_id: id }).unwrap();
        manager
            .trigger(LifecycleAction::Scale {
                service_id: id,
                role: "web".into(),
                cardinality: 2,
                force: true,
            })
            .unwrap();
        manager.trigger(LifecycleAction::Deploy { service_id: id }).unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    for &id in &ids {
        while manager.service(id).unwrap().unwrap().state != ServiceState::Running {
            assert!(tokio::time::Instant::now() < deadline, "service {id} never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    assert_eq!(tracking.peak_per_service.load(Ordering::SeqCst), 1);
    assert_eq!(tracking.peak_total.load(Ordering::SeqCst), 2);
    manager.shutdown().await;
}
