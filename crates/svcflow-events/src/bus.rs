//! Publish/subscribe transports.
//!
//! A wait opens its own [`Subscription`], subscribes to exact topics and
//! receives with a timeout. Two transports exist: [`LocalBus`] for
//! in-process publishers (the simulated backend, tests) and
//! [`TcpEventSource`] for an external publisher streaming
//! newline-delimited JSON.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use svcflow_backend::{NodeState, TransitionHook};
use svcflow_core::NodeId;

use crate::error::BusError;
use crate::topic::NodeTopic;

/// One published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BusMessage {
    pub fn node_state(node: NodeId, state: NodeState) -> Self {
        Self {
            topic: NodeTopic::new(node, state).render(),
            payload: serde_json::Value::Null,
        }
    }
}

/// An open subscription with an exact-match topic filter.
#[async_trait]
pub trait Subscription: Send {
    fn subscribe(&mut self, topic: &str);

    fn unsubscribe(&mut self, topic: &str);

    /// Next message on a subscribed topic, or `None` once `timeout`
    /// elapses without one.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError>;
}

/// Something a wait can open a subscription on.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Subscription>, BusError>;
}

// ── Local broadcast bus ────────────────────────────────────────────

/// In-process bus on a tokio broadcast channel.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to every open subscription. Messages published while nobody
    /// is subscribed are lost.
    pub fn publish(&self, message: BusMessage) {
        let _ = self.tx.send(message);
    }

    pub fn publish_node_state(&self, node: NodeId, state: NodeState) {
        self.publish(BusMessage::node_state(node, state));
    }

    /// A backend transition hook that republishes onto this bus.
    pub fn transition_hook(&self) -> TransitionHook {
        let bus = self.clone();
        Arc::new(move |node, state| bus.publish_node_state(node, state))
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSource for LocalBus {
    async fn open(&self) -> Result<Box<dyn Subscription>, BusError> {
        Ok(Box::new(LocalSubscription {
            rx: self.tx.subscribe(),
            topics: HashSet::new(),
        }))
    }
}

struct LocalSubscription {
    rx: broadcast::Receiver<BusMessage>,
    topics: HashSet<String>,
}

#[async_trait]
impl Subscription for LocalSubscription {
    fn subscribe(&mut self, topic: &str) {
        self.topics.insert(topic.to_string());
    }

    fn unsubscribe(&mut self, topic: &str) {
        self.topics.remove(topic);
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(message)) if self.topics.contains(&message.topic) => {
                    return Ok(Some(message));
                }
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "local bus subscriber lagged, events dropped");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(BusError::Closed),
            }
        }
    }
}

// ── TCP subscriber ────────────────────────────────────────────────

/// Subscriber for a publisher streaming one JSON [`BusMessage`] per line.
#[derive(Debug, Clone)]
pub struct TcpEventSource {
    addr: String,
}

impl TcpEventSource {
    /// `addr` is `host:port`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl EventSource for TcpEventSource {
    async fn open(&self) -> Result<Box<dyn Subscription>, BusError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| BusError::Connect {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;
        debug!(addr = %self.addr, "event subscriber connected");
        Ok(Box::new(TcpSubscription {
            lines: BufReader::new(stream).lines(),
            topics: HashSet::new(),
        }))
    }
}

struct TcpSubscription {
    lines: Lines<BufReader<TcpStream>>,
    topics: HashSet<String>,
}

#[async_trait]
impl Subscription for TcpSubscription {
    fn subscribe(&mut self, topic: &str) {
        self.topics.insert(topic.to_string());
    }

    fn unsubscribe(&mut self, topic: &str) {
        self.topics.remove(topic);
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let line = match tokio::time::timeout_at(deadline, self.lines.next_line()).await {
                Err(_) => return Ok(None),
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Err(BusError::Closed),
                Ok(Err(e)) => return Err(BusError::Transport(e.to_string())),
            };

            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BusMessage>(&line) {
                Ok(message) if self.topics.contains(&message.topic) => return Ok(Some(message)),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "discarding malformed event line"),
            }
        }
    }
}
