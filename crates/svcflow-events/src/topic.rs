//! Node state-change topics.
//!
//! `EVENT STATE VM/<state>/<substate>/<node-id>`, e.g.
//! `EVENT STATE VM/ACTIVE/RUNNING/42`. Subscriptions match the whole
//! string.

use std::fmt;

use svcflow_backend::{LcmState, NodeState, VmState};
use svcflow_core::NodeId;

const PREFIX: &str = "EVENT STATE VM/";

/// A node reaching a `(state, substate)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTopic {
    pub node: NodeId,
    pub state: NodeState,
}

impl NodeTopic {
    pub fn new(node: NodeId, state: NodeState) -> Self {
        Self { node, state }
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Decode a topic string. Returns `None` for anything that is not a
    /// well-formed node state topic.
    pub fn parse(topic: &str) -> Option<Self> {
        let rest = topic.strip_prefix(PREFIX)?;
        let mut parts = rest.split('/');
        let state = parts.next()?.parse::<VmState>().ok()?;
        let lcm = parts.next()?.parse::<LcmState>().ok()?;
        let node = parts.next()?.parse::<NodeId>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(node, NodeState::new(state, lcm)))
    }
}

impl fmt::Display for NodeTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PREFIX}{}/{}/{}",
            self.state.state, self.state.lcm, self.node
        )
    }
}
