//! svcflow-backend — the compute backend seen by the lifecycle engine.
//!
//! The engine never places or configures nodes itself. It asks a
//! [`ComputeBackend`] to create, shut down and query nodes, and to create
//! or delete the networks a service owns. Two implementations ship here:
//!
//! - [`HttpBackend`]: JSON over HTTP/1.1 against a backend endpoint.
//! - [`SimulatedBackend`]: in-memory nodes that converge after a delay and
//!   announce each transition, used by tests and `flowd --simulate`.

pub mod error;
pub mod http;
pub mod sim;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;

use svcflow_core::{NetworkId, NodeId};

pub use error::{BackendError, BackendResult};
pub use http::HttpBackend;
pub use sim::{SimulatedBackend, TransitionHook};
pub use types::{LcmState, NetworkSpec, NodeAction, NodeSpec, NodeState, VmState};

/// Operations the lifecycle engine issues against the infrastructure.
///
/// Every call is a single request; none of them waits for the node to
/// converge. Convergence is observed through the event bus.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Create one node from a template, returning its id.
    async fn deploy(&self, spec: &NodeSpec) -> BackendResult<NodeId>;

    /// Ask a node to shut down. `hard` destroys it immediately.
    async fn shutdown(&self, node: NodeId, hard: bool) -> BackendResult<()>;

    /// Current state of a node. Fails with [`BackendError::NodeNotFound`]
    /// once the node has been removed.
    async fn query(&self, node: NodeId) -> BackendResult<NodeState>;

    async fn create_network(&self, spec: &NetworkSpec) -> BackendResult<NetworkId>;

    async fn delete_network(&self, network: NetworkId) -> BackendResult<()>;

    async fn chown(&self, node: NodeId, uid: u32, gid: u32) -> BackendResult<()>;

    async fn chmod(&self, node: NodeId, octet: &str) -> BackendResult<()>;

    /// Have the backend run `action` on a node once `after` has elapsed.
    async fn schedule_action(
        &self,
        node: NodeId,
        action: NodeAction,
        after: Duration,
    ) -> BackendResult<()>;

    /// Let the backend repair a node in a warning condition.
    async fn recover_warning(&self, node: NodeId) -> BackendResult<()> {
        let _ = node;
        Ok(())
    }
}
