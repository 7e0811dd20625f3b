//! In-memory compute backend.
//!
//! Nodes boot and shut down after a fixed delay. Every state change is
//! reported to an optional [`TransitionHook`], which tests and
//! `flowd --simulate` wire to an event bus. Failure knobs let tests drive
//! the engine down its error paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use svcflow_core::{NetworkId, NodeId};

use crate::error::{BackendError, BackendResult};
use crate::types::{LcmState, NetworkSpec, NodeAction, NodeSpec, NodeState, VmState};
use crate::ComputeBackend;

/// Called after every simulated node transition.
pub type TransitionHook = Arc<dyn Fn(NodeId, NodeState) + Send + Sync>;

#[derive(Debug)]
struct SimNode {
    spec: NodeSpec,
    state: NodeState,
    owner: Option<(u32, u32)>,
    permissions: Option<String>,
}

#[derive(Default)]
struct SimState {
    nodes: HashMap<NodeId, SimNode>,
    networks: HashMap<NetworkId, NetworkSpec>,
    next_node: NodeId,
    next_network: NetworkId,
    deployed: Vec<NodeId>,
    shutdowns: Vec<(NodeId, bool)>,
    deleted_networks: Vec<NetworkId>,
    recovered: Vec<NodeId>,
    scheduled: Vec<(NodeId, NodeAction, Duration)>,
    fail_deploy_roles: HashSet<String>,
    boot_failure_roles: HashSet<String>,
    fail_chown_nodes: HashSet<NodeId>,
    fail_networks: bool,
    fail_shutdowns: bool,
    fail_scheduling: bool,
    unreachable: bool,
    silent: bool,
}

/// Simulated backend. Clones share the same node table.
#[derive(Clone)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
    delay: Duration,
    hook: Option<TransitionHook>,
}

impl SimulatedBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                next_node: 100,
                next_network: 1,
                ..SimState::default()
            })),
            delay,
            hook: None,
        }
    }

    /// Report transitions through `hook`.
    pub fn with_hook(mut self, hook: TransitionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Failure knobs ──────────────────────────────────────────────

    /// `deploy` calls for nodes of `role` fail outright.
    pub fn fail_deploys_for(&self, role: &str) {
        self.lock().fail_deploy_roles.insert(role.to_string());
    }

    /// Nodes of `role` land in `BOOT_FAILURE` instead of `RUNNING`.
    pub fn boot_failure_for(&self, role: &str) {
        self.lock().boot_failure_roles.insert(role.to_string());
    }

    /// Clear every per-role failure knob.
    pub fn heal(&self) {
        let mut state = self.lock();
        state.fail_deploy_roles.clear();
        state.boot_failure_roles.clear();
        state.fail_chown_nodes.clear();
        state.fail_networks = false;
        state.fail_shutdowns = false;
        state.fail_scheduling = false;
        state.unreachable = false;
    }

    pub fn fail_chown_for(&self, node: NodeId) {
        self.lock().fail_chown_nodes.insert(node);
    }

    pub fn fail_networks(&self, fail: bool) {
        self.lock().fail_networks = fail;
    }

    pub fn fail_shutdowns(&self, fail: bool) {
        self.lock().fail_shutdowns = fail;
    }

    pub fn fail_scheduling(&self, fail: bool) {
        self.lock().fail_scheduling = fail;
    }

    /// `query` fails with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Keep transitioning nodes but stop calling the hook.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Force a node into a state and report it.
    pub fn set_node_state(&self, node: NodeId, new_state: NodeState) {
        self.transition(node, new_state);
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Every node id handed out by `deploy`, in order.
    pub fn deployed(&self) -> Vec<NodeId> {
        self.lock().deployed.clone()
    }

    /// Every `shutdown` call as `(node, hard)`, in order.
    pub fn shutdowns(&self) -> Vec<(NodeId, bool)> {
        self.lock().shutdowns.clone()
    }

    pub fn node_state(&self, node: NodeId) -> Option<NodeState> {
        self.lock().nodes.get(&node).map(|n| n.state)
    }

    /// Role name a node was deployed for.
    pub fn node_role(&self, node: NodeId) -> Option<String> {
        self.lock().nodes.get(&node).map(|n| n.spec.role.clone())
    }

    pub fn node_owner(&self, node: NodeId) -> Option<(u32, u32)> {
        self.lock().nodes.get(&node).and_then(|n| n.owner)
    }

    pub fn node_permissions(&self, node: NodeId) -> Option<String> {
        self.lock().nodes.get(&node).and_then(|n| n.permissions.clone())
    }

    /// Number of nodes that still exist.
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn networks(&self) -> Vec<NetworkId> {
        let mut ids: Vec<_> = self.lock().networks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn deleted_networks(&self) -> Vec<NetworkId> {
        self.lock().deleted_networks.clone()
    }

    pub fn recovered(&self) -> Vec<NodeId> {
        self.lock().recovered.clone()
    }

    /// Every accepted `schedule_action` call, in order. Scheduled actions
    /// are recorded, never executed.
    pub fn scheduled(&self) -> Vec<(NodeId, NodeAction, Duration)> {
        self.lock().scheduled.clone()
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Apply a state change, removing the node once it is DONE.
    fn transition(&self, node: NodeId, new_state: NodeState) {
        let silent = {
            let mut state = self.lock();
            if new_state.is_done() {
                state.nodes.remove(&node);
            } else if let Some(n) = state.nodes.get_mut(&node) {
                n.state = new_state;
            } else {
                return;
            }
            state.silent
        };

        debug!(node, state = %new_state, "simulated node transition");
        if let (false, Some(hook)) = (silent, &self.hook) {
            hook(node, new_state);
        }
    }

    /// Apply `new_state` after the configured delay, unless the node has
    /// moved on since.
    fn schedule(&self, node: NodeId, expect: NodeState, new_state: NodeState) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            if this.node_state(node) == Some(expect) {
                this.transition(node, new_state);
            }
        });
    }
}

#[async_trait]
impl ComputeBackend for SimulatedBackend {
    async fn deploy(&self, spec: &NodeSpec) -> BackendResult<NodeId> {
        let pending = NodeState::new(VmState::Pending, LcmState::LcmInit);
        let (node, target) = {
            let mut state = self.lock();
            if state.fail_deploy_roles.contains(&spec.role) {
                return Err(BackendError::Rejected(format!(
                    "cannot allocate node for role {}",
                    spec.role
                )));
            }

            let node = state.next_node;
            state.next_node += 1;
            state.deployed.push(node);
            state.nodes.insert(
                node,
                SimNode {
                    spec: spec.clone(),
                    state: pending,
                    owner: None,
                    permissions: None,
                },
            );

            let target = if state.boot_failure_roles.contains(&spec.role) {
                NodeState::new(VmState::Active, LcmState::BootFailure)
            } else {
                NodeState::RUNNING
            };
            (node, target)
        };

        debug!(node, name = %spec.name, "simulated deploy");
        self.schedule(node, pending, target);
        Ok(node)
    }

    async fn shutdown(&self, node: NodeId, hard: bool) -> BackendResult<()> {
        let shutting_down = NodeState::new(VmState::Active, LcmState::Shutdown);
        {
            let mut state = self.lock();
            if state.fail_shutdowns {
                return Err(BackendError::Rejected(format!("cannot shut down node {node}")));
            }
            state.shutdowns.push((node, hard));
            match state.nodes.get_mut(&node) {
                Some(n) => n.state = shutting_down,
                None => return Err(BackendError::NodeNotFound(node)),
            }
        }

        debug!(node, hard, "simulated shutdown");
        if hard {
            self.transition(node, NodeState::DONE);
        } else {
            self.schedule(node, shutting_down, NodeState::DONE);
        }
        Ok(())
    }

    async fn query(&self, node: NodeId) -> BackendResult<NodeState> {
        let state = self.lock();
        if state.unreachable {
            return Err(BackendError::Transport("connection refused".to_string()));
        }
        state
            .nodes
            .get(&node)
            .map(|n| n.state)
            .ok_or(BackendError::NodeNotFound(node))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> BackendResult<NetworkId> {
        let mut state = self.lock();
        if state.fail_networks {
            return Err(BackendError::Rejected(format!(
                "cannot create network {}",
                spec.name
            )));
        }
        let id = state.next_network;
        state.next_network += 1;
        state.networks.insert(id, spec.clone());
        Ok(id)
    }

    async fn delete_network(&self, network: NetworkId) -> BackendResult<()> {
        let mut state = self.lock();
        if state.fail_networks {
            return Err(BackendError::Rejected(format!(
                "cannot delete network {network}"
            )));
        }
        state
            .networks
            .remove(&network)
            .ok_or(BackendError::NetworkNotFound(network))?;
        state.deleted_networks.push(network);
        Ok(())
    }

    async fn chown(&self, node: NodeId, uid: u32, gid: u32) -> BackendResult<()> {
        let mut state = self.lock();
        if state.fail_chown_nodes.contains(&node) {
            return Err(BackendError::Rejected(format!("chown denied for node {node}")));
        }
        let n = state
            .nodes
            .get_mut(&node)
            .ok_or(BackendError::NodeNotFound(node))?;
        n.owner = Some((uid, gid));
        Ok(())
    }

    async fn chmod(&self, node: NodeId, octet: &str) -> BackendResult<()> {
        let mut state = self.lock();
        let n = state
            .nodes
            .get_mut(&node)
            .ok_or(BackendError::NodeNotFound(node))?;
        n.permissions = Some(octet.to_string());
        Ok(())
    }

    async fn schedule_action(
        &self,
        node: NodeId,
        action: NodeAction,
        after: Duration,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        if state.fail_scheduling {
            return Err(BackendError::Rejected(format!(
                "cannot schedule {action} on node {node}"
            )));
        }
        if !state.nodes.contains_key(&node) {
            return Err(BackendError::NodeNotFound(node));
        }
        state.scheduled.push((node, action, after));
        Ok(())
    }

    async fn recover_warning(&self, node: NodeId) -> BackendResult<()> {
        let mut state = self.lock();
        if !state.nodes.contains_key(&node) {
            return Err(BackendError::NodeNotFound(node));
        }
        state.recovered.push(node);
        Ok(())
    }
}
