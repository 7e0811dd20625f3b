//! Lifecycle actions: operations and wait callbacks.

use svcflow_backend::NodeAction;
use svcflow_dispatch::{Action, EntityId};
use svcflow_events::{WaitKind, WaitReport, WaitStatus};
use svcflow_state::{NodeId, ServiceId};

/// A unit of work for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    Deploy {
        service_id: ServiceId,
    },
    Undeploy {
        service_id: ServiceId,
    },
    Scale {
        service_id: ServiceId,
        role: String,
        cardinality: u32,
        force: bool,
    },
    Recover {
        service_id: ServiceId,
    },
    Delete {
        service_id: ServiceId,
    },
    Chown {
        service_id: ServiceId,
        uid: u32,
        gid: u32,
    },
    Chgrp {
        service_id: ServiceId,
        gid: u32,
    },
    Chmod {
        service_id: ServiceId,
        permissions: String,
    },
    Rename {
        service_id: ServiceId,
        name: String,
    },
    SchedAction {
        service_id: ServiceId,
        role: String,
        action: NodeAction,
        period: Option<u64>,
        number: Option<u32>,
    },

    // ── Wait callbacks ─────────────────────────────────────────────
    DeployCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
    },
    DeployFailureCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
        reason: String,
    },
    UndeployCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
    },
    UndeployFailureCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
        reason: String,
    },
    ScaleUpCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
    },
    ScaleDownCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
    },
    ScaleFailureCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
        reason: String,
    },
    CooldownCb {
        service_id: ServiceId,
        role: String,
    },
    DeleteCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
    },
    DeleteFailureCb {
        service_id: ServiceId,
        role: String,
        nodes: Vec<NodeId>,
        reason: String,
    },
}

impl LifecycleAction {
    /// Every action name, for handler registration.
    pub const NAMES: [&'static str; 20] = [
        "deploy",
        "undeploy",
        "scale",
        "recover",
        "delete",
        "chown",
        "chgrp",
        "chmod",
        "rename",
        "sched_action",
        "deploy_cb",
        "deploy_failure_cb",
        "undeploy_cb",
        "undeploy_failure_cb",
        "scaleup_cb",
        "scaledown_cb",
        "scale_failure_cb",
        "cooldown_cb",
        "delete_cb",
        "delete_failure_cb",
    ];

    pub fn service_id(&self) -> ServiceId {
        match self {
            LifecycleAction::Deploy { service_id }
            | LifecycleAction::Undeploy { service_id }
            | LifecycleAction::Scale { service_id, .. }
            | LifecycleAction::Recover { service_id }
            | LifecycleAction::Delete { service_id }
            | LifecycleAction::Chown { service_id, .. }
            | LifecycleAction::Chgrp { service_id, .. }
            | LifecycleAction::Chmod { service_id, .. }
            | LifecycleAction::Rename { service_id, .. }
            | LifecycleAction::SchedAction { service_id, .. }
            | LifecycleAction::DeployCb { service_id, .. }
            | LifecycleAction::DeployFailureCb { service_id, .. }
            | LifecycleAction::UndeployCb { service_id, .. }
            | LifecycleAction::UndeployFailureCb { service_id, .. }
            | LifecycleAction::ScaleUpCb { service_id, .. }
            | LifecycleAction::ScaleDownCb { service_id, .. }
            | LifecycleAction::ScaleFailureCb { service_id, .. }
            | LifecycleAction::CooldownCb { service_id, .. }
            | LifecycleAction::DeleteCb { service_id, .. }
            | LifecycleAction::DeleteFailureCb { service_id, .. } => *service_id,
        }
    }

    /// Whether this action reports a finished wait.
    pub fn is_callback(&self) -> bool {
        self.name().ends_with("_cb")
    }
}

impl Action for LifecycleAction {
    fn name(&self) -> &'static str {
        match self {
            LifecycleAction::Deploy { .. } => "deploy",
            LifecycleAction::Undeploy { .. } => "undeploy",
            LifecycleAction::Scale { .. } => "scale",
            LifecycleAction::Recover { .. } => "recover",
            LifecycleAction::Delete { .. } => "delete",
            LifecycleAction::Chown { .. } => "chown",
            LifecycleAction::Chgrp { .. } => "chgrp",
            LifecycleAction::Chmod { .. } => "chmod",
            LifecycleAction::Rename { .. } => "rename",
            LifecycleAction::SchedAction { .. } => "sched_action",
            LifecycleAction::DeployCb { .. } => "deploy_cb",
            LifecycleAction::DeployFailureCb { .. } => "deploy_failure_cb",
            LifecycleAction::UndeployCb { .. } => "undeploy_cb",
            LifecycleAction::UndeployFailureCb { .. } => "undeploy_failure_cb",
            LifecycleAction::ScaleUpCb { .. } => "scaleup_cb",
            LifecycleAction::ScaleDownCb { .. } => "scaledown_cb",
            LifecycleAction::ScaleFailureCb { .. } => "scale_failure_cb",
            LifecycleAction::CooldownCb { .. } => "cooldown_cb",
            LifecycleAction::DeleteCb { .. } => "delete_cb",
            LifecycleAction::DeleteFailureCb { .. } => "delete_failure_cb",
        }
    }

    fn entity_id(&self) -> EntityId {
        self.service_id()
    }
}

impl From<WaitReport> for LifecycleAction {
    fn from(report: WaitReport) -> Self {
        let WaitReport {
            service_id,
            role,
            kind,
            status,
        } = report;

        match (kind, status) {
            (WaitKind::Cooldown, _) => LifecycleAction::CooldownCb { service_id, role },
            (WaitKind::Deploy, WaitStatus::Success { nodes }) => {
                LifecycleAction::DeployCb { service_id, role, nodes }
            }
            (WaitKind::Deploy, WaitStatus::Failed { nodes, reason }) => {
                LifecycleAction::DeployFailureCb { service_id, role, nodes, reason }
            }
            (WaitKind::Undeploy, WaitStatus::Success { nodes }) => {
                LifecycleAction::UndeployCb { service_id, role, nodes }
            }
            (WaitKind::Undeploy, WaitStatus::Failed { nodes, reason }) => {
                LifecycleAction::UndeployFailureCb { service_id, role, nodes, reason }
            }
            (WaitKind::ScaleUp, WaitStatus::Success { nodes }) => {
                LifecycleAction::ScaleUpCb { service_id, role, nodes }
            }
            (WaitKind::ScaleDown, WaitStatus::Success { nodes }) => {
                LifecycleAction::ScaleDownCb { service_id, role, nodes }
            }
            (WaitKind::ScaleUp | WaitKind::ScaleDown, WaitStatus::Failed { nodes, reason }) => {
                LifecycleAction::ScaleFailureCb { service_id, role, nodes, reason }
            }
            (WaitKind::Delete, WaitStatus::Success { nodes }) => {
                LifecycleAction::DeleteCb { service_id, role, nodes }
            }
            (WaitKind::Delete, WaitStatus::Failed { nodes, reason }) => {
                LifecycleAction::DeleteFailureCb { service_id, role, nodes, reason }
            }
        }
    }
}
