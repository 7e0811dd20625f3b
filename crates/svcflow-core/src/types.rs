//! Identifier aliases and small enums shared by every svcflow crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a service document, assigned by the store.
pub type ServiceId = u64;

/// Identifier of a compute node (virtual machine) in the backend.
pub type NodeId = u64;

/// Identifier of a virtual network in the backend.
pub type NetworkId = u64;

/// How nodes are shut down when a role is undeployed or scaled down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownAction {
    /// Graceful shutdown, the guest is asked to power off.
    #[default]
    Terminate,
    /// Immediate destroy.
    TerminateHard,
}

impl ShutdownAction {
    pub fn is_hard(self) -> bool {
        self == ShutdownAction::TerminateHard
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownAction::Terminate => "terminate",
            ShutdownAction::TerminateHard => "terminate-hard",
        }
    }
}

impl fmt::Display for ShutdownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShutdownAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terminate" => Ok(ShutdownAction::Terminate),
            "terminate-hard" => Ok(ShutdownAction::TerminateHard),
            other => Err(format!("unknown shutdown action: {other}")),
        }
    }
}
