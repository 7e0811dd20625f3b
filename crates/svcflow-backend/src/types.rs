//! Node and network shapes exchanged with the backend.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use svcflow_core::ServiceId;

/// Declares a state enum whose variants map one-to-one onto the upper-case
/// names used in topics and on the wire.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }
    };
}

wire_enum! {
    /// Coarse node state.
    VmState {
        Init => "INIT",
        Pending => "PENDING",
        Hold => "HOLD",
        Active => "ACTIVE",
        Stopped => "STOPPED",
        Suspended => "SUSPENDED",
        Done => "DONE",
        Poweroff => "POWEROFF",
        Undeployed => "UNDEPLOYED",
    }
}

wire_enum! {
    /// Fine-grained sub-state of an `ACTIVE` node.
    LcmState {
        LcmInit => "LCM_INIT",
        Prolog => "PROLOG",
        Boot => "BOOT",
        Running => "RUNNING",
        Migrate => "MIGRATE",
        Shutdown => "SHUTDOWN",
        ShutdownPoweroff => "SHUTDOWN_POWEROFF",
        ShutdownUndeploy => "SHUTDOWN_UNDEPLOY",
        Epilog => "EPILOG",
        CleanupResubmit => "CLEANUP_RESUBMIT",
        CleanupDelete => "CLEANUP_DELETE",
        Unknown => "UNKNOWN",
        BootFailure => "BOOT_FAILURE",
        BootMigrateFailure => "BOOT_MIGRATE_FAILURE",
        PrologMigrateFailure => "PROLOG_MIGRATE_FAILURE",
        PrologFailure => "PROLOG_FAILURE",
        EpilogFailure => "EPILOG_FAILURE",
        EpilogStopFailure => "EPILOG_STOP_FAILURE",
        EpilogUndeployFailure => "EPILOG_UNDEPLOY_FAILURE",
        PrologMigratePoweroffFailure => "PROLOG_MIGRATE_POWEROFF_FAILURE",
        PrologMigrateSuspendFailure => "PROLOG_MIGRATE_SUSPEND_FAILURE",
        PrologMigrateUnknownFailure => "PROLOG_MIGRATE_UNKNOWN_FAILURE",
        BootUndeployFailure => "BOOT_UNDEPLOY_FAILURE",
        BootStoppedFailure => "BOOT_STOPPED_FAILURE",
        PrologResumeFailure => "PROLOG_RESUME_FAILURE",
        PrologUndeployFailure => "PROLOG_UNDEPLOY_FAILURE",
    }
}

/// `(state, substate)` pair reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub state: VmState,
    #[serde(rename = "substate")]
    pub lcm: LcmState,
}

impl NodeState {
    pub const fn new(state: VmState, lcm: LcmState) -> Self {
        Self { state, lcm }
    }

    /// A booted, running node.
    pub const RUNNING: NodeState = NodeState::new(VmState::Active, LcmState::Running);

    /// A node that has been removed.
    pub const DONE: NodeState = NodeState::new(VmState::Done, LcmState::LcmInit);

    pub fn is_done(&self) -> bool {
        self.state == VmState::Done
    }
}

wire_enum! {
    /// Node actions a role can schedule on its nodes.
    NodeAction {
        Terminate => "terminate",
        TerminateHard => "terminate-hard",
        Undeploy => "undeploy",
        UndeployHard => "undeploy-hard",
        Hold => "hold",
        Release => "release",
        Stop => "stop",
        Suspend => "suspend",
        Resume => "resume",
        Reboot => "reboot",
        RebootHard => "reboot-hard",
        Poweroff => "poweroff",
        PoweroffHard => "poweroff-hard",
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state, self.lcm)
    }
}

/// Request to create one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub service_id: ServiceId,
    pub role: String,
    /// Node name, `<role>_<index>_(service_<id>)`.
    pub name: String,
    pub template: serde_json::Value,
}

impl NodeSpec {
    pub fn new(service_id: ServiceId, role: &str, index: usize, template: serde_json::Value) -> Self {
        Self {
            service_id,
            role: role.to_string(),
            name: format!("{role}_{index}_(service_{service_id})"),
            template,
        }
    }
}

/// Request to create one virtual network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub service_id: ServiceId,
    pub name: String,
    pub template: serde_json::Value,
}
