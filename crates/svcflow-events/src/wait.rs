//! NodeWaiter: block until a set of nodes reaches a target state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use svcflow_backend::{ComputeBackend, LcmState, NodeState};
use svcflow_core::NodeId;

use crate::bus::{EventSource, Subscription};
use crate::error::WaitError;
use crate::topic::NodeTopic;

/// Sub-states that mean a node will not converge on its own.
pub const FAILURE_SUBSTATES: [LcmState; 14] = [
    LcmState::BootFailure,
    LcmState::BootMigrateFailure,
    LcmState::PrologMigrateFailure,
    LcmState::PrologFailure,
    LcmState::EpilogFailure,
    LcmState::EpilogStopFailure,
    LcmState::EpilogUndeployFailure,
    LcmState::PrologMigratePoweroffFailure,
    LcmState::PrologMigrateSuspendFailure,
    LcmState::PrologMigrateUnknownFailure,
    LcmState::BootUndeployFailure,
    LcmState::BootStoppedFailure,
    LcmState::PrologResumeFailure,
    LcmState::PrologUndeployFailure,
];

/// Consecutive failed queries after which a node counts as failed.
pub const MAX_QUERY_FAILURES: u32 = 3;

pub fn is_failure(lcm: LcmState) -> bool {
    FAILURE_SUBSTATES.contains(&lcm)
}

/// What a finished wait observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Nodes that reached the target, or were removed.
    pub resolved: Vec<NodeId>,
    /// Nodes that hit a failure sub-state or stopped answering.
    pub failed: Vec<NodeId>,
}

impl WaitOutcome {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Waits on the bus, polling the backend whenever the bus times out.
#[derive(Clone)]
pub struct NodeWaiter {
    source: Arc<dyn EventSource>,
    backend: Arc<dyn ComputeBackend>,
    timeout: Duration,
}

/// Per-wait bookkeeping: pending node → topic, plus query failure counts.
struct Pending {
    topics: BTreeMap<NodeId, String>,
    query_failures: HashMap<NodeId, u32>,
    outcome: WaitOutcome,
}

impl Pending {
    fn resolve(&mut self, sub: &mut dyn Subscription, node: NodeId) {
        if let Some(topic) = self.topics.remove(&node) {
            sub.unsubscribe(&topic);
            self.outcome.resolved.push(node);
        }
    }

    fn fail(&mut self, sub: &mut dyn Subscription, node: NodeId) {
        if let Some(topic) = self.topics.remove(&node) {
            sub.unsubscribe(&topic);
            self.outcome.failed.push(node);
        }
    }

    fn is_finished(&self) -> bool {
        self.topics.is_empty() || !self.outcome.failed.is_empty()
    }
}

impl NodeWaiter {
    pub fn new(
        source: Arc<dyn EventSource>,
        backend: Arc<dyn ComputeBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            backend,
            timeout,
        }
    }

    /// Wait until every node in `nodes` reaches `target`, or any of them
    /// fails.
    ///
    /// A node also counts as resolved once it is `DONE` or no longer known
    /// to the backend. When a node fails the remaining ones are abandoned.
    /// Setting `cancel` to `true` ends the wait with
    /// [`WaitError::Cancelled`].
    pub async fn wait_for(
        &self,
        nodes: &[NodeId],
        target: NodeState,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<WaitOutcome, WaitError> {
        if nodes.is_empty() {
            return Ok(WaitOutcome::default());
        }
        if *cancel.borrow() {
            return Err(WaitError::Cancelled);
        }

        let mut sub = self.source.open().await?;
        let mut pending = Pending {
            topics: BTreeMap::new(),
            query_failures: HashMap::new(),
            outcome: WaitOutcome::default(),
        };
        for &node in nodes {
            let topic = NodeTopic::new(node, target).render();
            sub.subscribe(&topic);
            pending.topics.insert(node, topic);
        }
        debug!(?nodes, %target, "wait subscribed");

        while !pending.is_finished() {
            let received = tokio::select! {
                received = sub.recv(self.timeout) => received?,
                _ = cancelled(cancel) => return Err(WaitError::Cancelled),
            };

            match received {
                Some(message) => {
                    if let Some(topic) = NodeTopic::parse(&message.topic) {
                        debug!(node = topic.node, state = %topic.state, "node event");
                        pending.resolve(sub.as_mut(), topic.node);
                    }
                }
                None => self.poll(&mut pending, sub.as_mut(), target).await,
            }
        }

        if !pending.outcome.success() {
            info!(
                failed = ?pending.outcome.failed,
                abandoned = ?pending.topics.keys().collect::<Vec<_>>(),
                "wait ended with failed nodes"
            );
        }
        Ok(pending.outcome)
    }

    /// Query every pending node once.
    async fn poll(&self, pending: &mut Pending, sub: &mut dyn Subscription, target: NodeState) {
        let nodes: Vec<NodeId> = pending.topics.keys().copied().collect();
        debug!(?nodes, "bus quiet, polling backend");

        for node in nodes {
            match self.backend.query(node).await {
                Ok(state) if state.is_done() || state == target => {
                    pending.query_failures.remove(&node);
                    pending.resolve(sub, node);
                }
                Ok(state) if is_failure(state.lcm) => {
                    warn!(node, %state, "node entered a failure state");
                    pending.fail(sub, node);
                }
                Ok(_) => {
                    pending.query_failures.remove(&node);
                }
                Err(e) if e.is_not_found() => pending.resolve(sub, node),
                Err(e) => {
                    let count = pending.query_failures.entry(node).or_insert(0);
                    *count += 1;
                    warn!(node, attempt = *count, error = %e, "node query failed");
                    if *count >= MAX_QUERY_FAILURES {
                        pending.fail(sub, node);
                    }
                }
            }
        }
    }
}

/// Resolves once the flag turns `true`. A dropped sender never resolves.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            if *rx.borrow() {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}
