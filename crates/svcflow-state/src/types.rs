//! Domain types for service documents.
//!
//! A `Service` is the unit the lifecycle engine orchestrates. It owns an
//! ordered list of `Role`s; each role tracks the backend nodes it has
//! asked for. Everything here is plain data plus the small invariants the
//! engine leans on (bounded log, state predicates); no I/O happens here.

use std::collections::HashSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use svcflow_core::{NetworkId, NodeId, ServiceId, ShutdownAction};

/// Maximum number of log entries kept per service.
pub const MAX_LOG_ENTRIES: usize = 50;

// ── States ────────────────────────────────────────────────────────

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    #[default]
    Pending,
    Deploying,
    Running,
    Undeploying,
    Warning,
    Done,
    FailedUndeploying,
    FailedDeploying,
    Scaling,
    FailedScaling,
    Cooldown,
    Deleting,
    FailedDeleting,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Pending => "PENDING",
            ServiceState::Deploying => "DEPLOYING",
            ServiceState::Running => "RUNNING",
            ServiceState::Undeploying => "UNDEPLOYING",
            ServiceState::Warning => "WARNING",
            ServiceState::Done => "DONE",
            ServiceState::FailedUndeploying => "FAILED_UNDEPLOYING",
            ServiceState::FailedDeploying => "FAILED_DEPLOYING",
            ServiceState::Scaling => "SCALING",
            ServiceState::FailedScaling => "FAILED_SCALING",
            ServiceState::Cooldown => "COOLDOWN",
            ServiceState::Deleting => "DELETING",
            ServiceState::FailedDeleting => "FAILED_DELETING",
        }
    }

    /// An operation was started and its waits may still be outstanding.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ServiceState::Deploying
                | ServiceState::Undeploying
                | ServiceState::Scaling
                | ServiceState::Cooldown
                | ServiceState::Deleting
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            ServiceState::FailedDeploying
                | ServiceState::FailedUndeploying
                | ServiceState::FailedScaling
                | ServiceState::FailedDeleting
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleState {
    #[default]
    Pending,
    Deploying,
    Running,
    Undeploying,
    Warning,
    Done,
    FailedUndeploying,
    FailedDeploying,
    Scaling,
    FailedScaling,
    Cooldown,
    Deleting,
    FailedDeleting,
}

impl RoleState {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleState::Pending => "PENDING",
            RoleState::Deploying => "DEPLOYING",
            RoleState::Running => "RUNNING",
            RoleState::Undeploying => "UNDEPLOYING",
            RoleState::Warning => "WARNING",
            RoleState::Done => "DONE",
            RoleState::FailedUndeploying => "FAILED_UNDEPLOYING",
            RoleState::FailedDeploying => "FAILED_DEPLOYING",
            RoleState::Scaling => "SCALING",
            RoleState::FailedScaling => "FAILED_SCALING",
            RoleState::Cooldown => "COOLDOWN",
            RoleState::Deleting => "DELETING",
            RoleState::FailedDeleting => "FAILED_DELETING",
        }
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            RoleState::FailedDeploying
                | RoleState::FailedUndeploying
                | RoleState::FailedScaling
                | RoleState::FailedDeleting
        )
    }
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering policy for role operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One role at a time, in dependency order.
    Straight,
    /// Every eligible role at once. Persisted as `none`.
    #[default]
    #[serde(rename = "none")]
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScaleDirection {
    Up,
    Down,
}

// ── Nodes ─────────────────────────────────────────────────────────

/// What the engine last observed about a node it asked the backend for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Deploying,
    Running,
    ShuttingDown,
    Failed,
}

impl NodeStatus {
    /// Counts towards the role's cardinality.
    pub fn is_live(self) -> bool {
        matches!(self, NodeStatus::Deploying | NodeStatus::Running)
    }
}

/// Lookup key into the compute backend. Not owned by the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub deploy_id: NodeId,
    pub status: NodeStatus,
}

// ── Role ──────────────────────────────────────────────────────────

/// A named, horizontally scalable group of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub cardinality: u32,
    #[serde(default)]
    pub state: RoleState,
    #[serde(default)]
    pub nodes: Vec<NodeRef>,
    #[serde(default)]
    pub scale_direction: Option<ScaleDirection>,
    /// Roles that must be RUNNING before this one deploys (straight only).
    #[serde(default)]
    pub parents: Vec<String>,
    /// Opaque node template handed to the backend.
    #[serde(default)]
    pub template: serde_json::Value,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default)]
    pub shutdown_action: Option<ShutdownAction>,
}

impl Role {
    pub fn new(name: &str, cardinality: u32) -> Self {
        Self {
            name: name.to_string(),
            cardinality,
            state: RoleState::Pending,
            nodes: Vec::new(),
            scale_direction: None,
            parents: Vec::new(),
            template: serde_json::Value::Null,
            cooldown_secs: None,
            shutdown_action: None,
        }
    }

    pub fn with_parents(mut self, parents: &[&str]) -> Self {
        self.parents = parents.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_template(mut self, template: serde_json::Value) -> Self {
        self.template = template;
        self
    }

    pub fn set_state(&mut self, state: RoleState) {
        if self.state != state {
            debug!(role = %self.name, from = %self.state, to = %state, "role state changed");
        }
        self.state = state;
    }

    /// Nodes that count towards the cardinality.
    pub fn live_count(&self) -> u32 {
        self.nodes.iter().filter(|n| n.status.is_live()).count() as u32
    }

    /// How many nodes must still be deployed to reach the cardinality.
    pub fn missing_nodes(&self) -> u32 {
        self.cardinality.saturating_sub(self.live_count())
    }

    /// How many live nodes exceed the cardinality.
    pub fn excess_nodes(&self) -> u32 {
        self.live_count().saturating_sub(self.cardinality)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.deploy_id).collect()
    }

    pub fn node_ids_with(&self, status: NodeStatus) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.status == status)
            .map(|n| n.deploy_id)
            .collect()
    }

    pub fn add_nodes(&mut self, ids: &[NodeId], status: NodeStatus) {
        self.nodes.extend(ids.iter().map(|&deploy_id| NodeRef { deploy_id, status }));
    }

    pub fn mark_nodes(&mut self, ids: &[NodeId], status: NodeStatus) {
        for node in self.nodes.iter_mut().filter(|n| ids.contains(&n.deploy_id)) {
            node.status = status;
        }
    }

    pub fn remove_nodes(&mut self, ids: &[NodeId]) {
        self.nodes.retain(|n| !ids.contains(&n.deploy_id));
    }

    /// Pick the live nodes to shut down to get rid of the excess over the
    /// cardinality, most recently deployed first. Failed refs never count.
    pub fn scale_down_candidates(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .rev()
            .filter(|n| n.status.is_live())
            .map(|n| n.deploy_id)
            .take(self.excess_nodes() as usize)
            .collect()
    }
}

// ── Service ───────────────────────────────────────────────────────

/// A virtual network the service created and owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRef {
    pub name: String,
    #[serde(default)]
    pub template: serde_json::Value,
    /// Filled in once the backend has created the network.
    #[serde(default)]
    pub network_id: Option<NetworkId>,
}

/// Owner and permission metadata, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
    /// Permission octet, e.g. `"640"`.
    pub permissions: String,
}

impl Default for Owner {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            permissions: "600".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "D")]
    Debug,
    #[serde(rename = "I")]
    Info,
    #[serde(rename = "W")]
    Warning,
    #[serde(rename = "E")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u64,
    pub severity: Severity,
    pub message: String,
}

/// A deployable group of roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub state: ServiceState,
    #[serde(default)]
    pub strategy: Strategy,
    pub roles: Vec<Role>,
    #[serde(default)]
    pub networks: Vec<NetworkRef>,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default)]
    pub shutdown_action: Option<ShutdownAction>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl Service {
    /// A fresh PENDING service; the id is assigned by the store.
    pub fn new(name: &str, strategy: Strategy, roles: Vec<Role>) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            state: ServiceState::Pending,
            strategy,
            roles,
            networks: Vec::new(),
            owner: Owner::default(),
            shutdown_action: None,
            log: Vec::new(),
        }
    }

    pub fn with_networks(mut self, networks: Vec<NetworkRef>) -> Self {
        self.networks = networks;
        self
    }

    /// Set a new state and record it in the service log.
    pub fn set_state(&mut self, state: ServiceState) {
        if self.state == state {
            return;
        }
        let msg = format!("New state: {state}");
        info!(service = self.id, from = %self.state, to = %state, "service state changed");
        self.state = state;
        self.log_info(&msg);
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn role_mut(&mut self, name: &str) -> Option<&mut Role> {
        self.roles.iter_mut().find(|r| r.name == name)
    }

    pub fn all_roles_running(&self) -> bool {
        self.roles.iter().all(|r| r.state == RoleState::Running)
    }

    pub fn all_roles_done(&self) -> bool {
        self.roles.iter().all(|r| r.state == RoleState::Done)
    }

    pub fn any_role_in(&self, state: RoleState) -> bool {
        self.roles.iter().any(|r| r.state == state)
    }

    pub fn any_role_failed(&self) -> bool {
        self.roles.iter().any(|r| r.state.is_failed())
    }

    /// Names of roles that currently hold `state`.
    pub fn roles_in(&self, state: RoleState) -> HashSet<String> {
        self.roles
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Shutdown action for a role: role override, then service override,
    /// then the configured default.
    pub fn shutdown_action_for(&self, role: &Role, default: ShutdownAction) -> ShutdownAction {
        role.shutdown_action
            .or(self.shutdown_action)
            .unwrap_or(default)
    }

    pub fn log_info(&mut self, message: &str) {
        self.add_log(Severity::Info, message);
    }

    pub fn log_warning(&mut self, message: &str) {
        self.add_log(Severity::Warning, message);
    }

    pub fn log_error(&mut self, message: &str) {
        self.add_log(Severity::Error, message);
    }

    fn add_log(&mut self, severity: Severity, message: &str) {
        self.log.push(LogEntry {
            timestamp: epoch_secs(),
            severity,
            message: message.to_string(),
        });
        if self.log.len() > MAX_LOG_ENTRIES {
            let overflow = self.log.len() - MAX_LOG_ENTRIES;
            self.log.drain(..overflow);
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_role_service() -> Service {
        Service::new(
            "web",
            Strategy::Straight,
            vec![Role::new("db", 1), Role::new("frontend", 2).with_parents(&["db"])],
        )
    }

    #[test]
    fn states_serialize_screaming_snake() {
        let json = serde_json::to_string(&ServiceState::FailedDeploying).unwrap();
        assert_eq!(json, "\"FAILED_DEPLOYING\"");
        assert_eq!(ServiceState::FailedDeploying.to_string(), "FAILED_DEPLOYING");
        let back: RoleState = serde_json::from_str("\"COOLDOWN\"").unwrap();
        assert_eq!(back, RoleState::Cooldown);
    }

    #[test]
    fn strategy_persists_as_straight_or_none() {
        assert_eq!(serde_json::to_string(&Strategy::Straight).unwrap(), "\"straight\"");
        assert_eq!(serde_json::to_string(&Strategy::Parallel).unwrap(), "\"none\"");
        let s: Strategy = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(s, Strategy::Parallel);
    }

    #[test]
    fn set_state_appends_log() {
        let mut svc = two_role_service();
        svc.set_state(ServiceState::Deploying);
        assert_eq!(svc.log.len(), 1);
        assert_eq!(svc.log[0].message, "New state: DEPLOYING");
        assert_eq!(svc.log[0].severity, Severity::Info);

        // Same state again is not logged twice.
        svc.set_state(ServiceState::Deploying);
        assert_eq!(svc.log.len(), 1);
    }

    #[test]
    fn log_is_capped_oldest_first() {
        let mut svc = two_role_service();
        for i in 0..(MAX_LOG_ENTRIES + 7) {
            svc.log_info(&format!("entry {i}"));
        }
        assert_eq!(svc.log.len(), MAX_LOG_ENTRIES);
        assert_eq!(svc.log[0].message, "entry 7");
        assert_eq!(svc.log.last().unwrap().message, format!("entry {}", MAX_LOG_ENTRIES + 6));
    }

    #[test]
    fn role_predicates() {
        let mut svc = two_role_service();
        assert!(!svc.all_roles_running());
        for role in &mut svc.roles {
            role.set_state(RoleState::Running);
        }
        assert!(svc.all_roles_running());
        assert!(!svc.all_roles_done());

        svc.role_mut("db").unwrap().set_state(RoleState::FailedDeploying);
        assert!(svc.any_role_failed());
        assert_eq!(svc.roles_in(RoleState::FailedDeploying).len(), 1);
    }

    #[test]
    fn missing_and_excess_nodes() {
        let mut role = Role::new("worker", 3);
        role.add_nodes(&[10, 11], NodeStatus::Running);
        role.add_nodes(&[12], NodeStatus::Failed);
        assert_eq!(role.live_count(), 2);
        assert_eq!(role.missing_nodes(), 1);
        assert_eq!(role.excess_nodes(), 0);

        role.cardinality = 1;
        assert_eq!(role.missing_nodes(), 0);
        assert_eq!(role.excess_nodes(), 1);
    }

    #[test]
    fn scale_down_takes_newest_live_nodes() {
        let mut role = Role::new("worker", 2);
        role.add_nodes(&[1, 2, 3], NodeStatus::Running);
        role.add_nodes(&[4], NodeStatus::Failed);
        role.add_nodes(&[5], NodeStatus::Running);

        assert_eq!(role.scale_down_candidates(), vec![5, 3]);

        role.cardinality = 4;
        assert!(role.scale_down_candidates().is_empty());
    }

    #[test]
    fn shutdown_action_precedence() {
        let mut svc = two_role_service();
        let role = svc.roles[0].clone();
        assert_eq!(
            svc.shutdown_action_for(&role, ShutdownAction::Terminate),
            ShutdownAction::Terminate
        );
        svc.shutdown_action = Some(ShutdownAction::TerminateHard);
        assert_eq!(
            svc.shutdown_action_for(&role, ShutdownAction::Terminate),
            ShutdownAction::TerminateHard
        );
        let mut role = role;
        role.shutdown_action = Some(ShutdownAction::Terminate);
        assert_eq!(
            svc.shutdown_action_for(&role, ShutdownAction::TerminateHard),
            ShutdownAction::Terminate
        );
    }

    #[test]
    fn document_shape_roundtrip() {
        let mut svc = two_role_service();
        svc.id = 7;
        svc.roles[0].add_nodes(&[42], NodeStatus::Running);
        let json = serde_json::to_value(&svc).unwrap();
        assert_eq!(json["state"], "PENDING");
        assert_eq!(json["strategy"], "straight");
        assert_eq!(json["roles"][0]["nodes"][0]["deploy_id"], 42);
        assert_eq!(json["roles"][0]["nodes"][0]["status"], "running");
        let back: Service = serde_json::from_value(json).unwrap();
        assert_eq!(back, svc);
    }
}
