//! EventManager: waits as cancellable dispatcher actions.
//!
//! Each node wait is queued on a dedicated [`Dispatcher`] without
//! per-entity exclusion, so the parallel role waits of one service run side
//! by side. Cooldowns are plain timers spawned next to that pool and never
//! hold one of its slots. A finished wait hands a [`WaitReport`] to the
//! registered [`WaitCallback`]; a cancelled wait reports nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use svcflow_backend::{ComputeBackend, NodeState};
use svcflow_core::{EventsConfig, NodeId, ServiceId};
use svcflow_dispatch::{Action, DispatchError, DispatchResult, Dispatcher, EntityId, Exclusion};

use crate::bus::EventSource;
use crate::error::WaitError;
use crate::wait::{NodeWaiter, cancelled};

/// Which lifecycle step a wait belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKind {
    Deploy,
    Undeploy,
    ScaleUp,
    ScaleDown,
    Delete,
    Cooldown,
}

impl WaitKind {
    /// Kinds that watch nodes and run on the wait pool.
    pub const NODE_KINDS: [WaitKind; 5] = [
        WaitKind::Deploy,
        WaitKind::Undeploy,
        WaitKind::ScaleUp,
        WaitKind::ScaleDown,
        WaitKind::Delete,
    ];

    pub fn action_name(self) -> &'static str {
        match self {
            WaitKind::Deploy => "wait_deploy",
            WaitKind::Undeploy => "wait_undeploy",
            WaitKind::ScaleUp => "wait_scaleup",
            WaitKind::ScaleDown => "wait_scaledown",
            WaitKind::Delete => "wait_delete",
            WaitKind::Cooldown => "wait_cooldown",
        }
    }

    /// State the watched nodes must reach.
    pub fn target(self) -> NodeState {
        match self {
            WaitKind::Deploy | WaitKind::ScaleUp => NodeState::RUNNING,
            _ => NodeState::DONE,
        }
    }
}

/// A queued node wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitAction {
    pub service_id: ServiceId,
    pub role: String,
    pub kind: WaitKind,
    pub nodes: Vec<NodeId>,
}

impl Action for WaitAction {
    fn name(&self) -> &'static str {
        self.kind.action_name()
    }

    fn entity_id(&self) -> EntityId {
        self.service_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    Success {
        nodes: Vec<NodeId>,
    },
    Failed {
        nodes: Vec<NodeId>,
        reason: String,
    },
}

/// Result of a wait, delivered to the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitReport {
    pub service_id: ServiceId,
    pub role: String,
    pub kind: WaitKind,
    pub status: WaitStatus,
}

impl WaitReport {
    pub fn is_success(&self) -> bool {
        matches!(self.status, WaitStatus::Success { .. })
    }
}

/// Receives every finished wait.
pub type WaitCallback = Arc<dyn Fn(WaitReport) + Send + Sync>;

// ── Cooldown timers ───────────────────────────────────────────────

/// Cooldown timers in flight, per service and in total.
struct Cooldowns {
    active: Mutex<HashMap<ServiceId, usize>>,
    total: watch::Sender<usize>,
}

impl Cooldowns {
    fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            total: watch::channel(0).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServiceId, usize>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(self: &Arc<Self>, service_id: ServiceId) -> CooldownSlot {
        *self.lock().entry(service_id).or_insert(0) += 1;
        self.total.send_modify(|n| *n += 1);
        CooldownSlot {
            cooldowns: Arc::clone(self),
            service_id,
        }
    }

    fn is_active(&self, service_id: ServiceId) -> bool {
        self.lock().contains_key(&service_id)
    }

    async fn idle(&self) {
        let mut rx = self.total.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Held by a running cooldown; releases its count on drop.
struct CooldownSlot {
    cooldowns: Arc<Cooldowns>,
    service_id: ServiceId,
}

impl Drop for CooldownSlot {
    fn drop(&mut self) {
        {
            let mut active = self.cooldowns.lock();
            if let Some(n) = active.get_mut(&self.service_id) {
                *n -= 1;
                if *n == 0 {
                    active.remove(&self.service_id);
                }
            }
        }
        self.cooldowns.total.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// ── EventManager ──────────────────────────────────────────────────

/// Runs node and cooldown waits.
#[derive(Clone)]
pub struct EventManager {
    dispatcher: Dispatcher<WaitAction>,
    waiter: NodeWaiter,
    callback: Option<WaitCallback>,
    cancels: Arc<Mutex<HashMap<ServiceId, watch::Sender<bool>>>>,
    cooldowns: Arc<Cooldowns>,
    stop: Arc<watch::Sender<bool>>,
}

impl EventManager {
    pub fn new(
        source: Arc<dyn EventSource>,
        backend: Arc<dyn ComputeBackend>,
        config: &EventsConfig,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::with_exclusion(
                "events",
                config.max_concurrent_waits,
                Exclusion::None,
            ),
            waiter: NodeWaiter::new(source, backend, config.wait_timeout()),
            callback: None,
            cancels: Arc::new(Mutex::new(HashMap::new())),
            cooldowns: Arc::new(Cooldowns::new()),
            stop: Arc::new(watch::channel(false).0),
        }
    }

    /// Set the receiver of wait reports.
    pub fn with_callback(mut self, callback: WaitCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Register the wait handlers and spawn the workers.
    pub fn start(&self) {
        for kind in WaitKind::NODE_KINDS {
            let this = self.clone();
            self.dispatcher.register(kind.action_name(), move |action| {
                let this = this.clone();
                async move {
                    this.run(action).await;
                    Ok(())
                }
            });
        }
        self.dispatcher.start();
    }

    /// Stop the wait pool and every pending cooldown.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        self.dispatcher.shutdown().await;
        self.cooldowns.idle().await;
    }

    /// Queue a wait for `nodes` of `role` to reach the target of `kind`.
    pub fn wait_nodes(
        &self,
        service_id: ServiceId,
        role: &str,
        kind: WaitKind,
        nodes: Vec<NodeId>,
    ) -> DispatchResult<()> {
        self.dispatcher.submit(WaitAction {
            service_id,
            role: role.to_string(),
            kind,
            nodes,
        })
    }

    /// Start a cooldown: report success for `role` after `period`.
    ///
    /// The timer runs on its own task, outside the wait pool.
    pub fn wait_cooldown(
        &self,
        service_id: ServiceId,
        role: &str,
        period: Duration,
    ) -> DispatchResult<()> {
        if *self.stop.borrow() {
            return Err(DispatchError::ShutDown("events"));
        }

        let mut cancel = self.cancel_receiver(service_id);
        let mut stop = self.stop.subscribe();
        let slot = self.cooldowns.enter(service_id);
        let role = role.to_string();
        let this = self.clone();
        debug!(service = service_id, role = %role, ?period, "cooldown started");

        tokio::spawn(async move {
            let _slot = slot;
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = cancelled(&mut cancel) => {
                    info!(service = service_id, role = %role, "cooldown cancelled");
                    return;
                }
                _ = cancelled(&mut stop) => {
                    debug!(service = service_id, role = %role, "cooldown dropped on shutdown");
                    return;
                }
            }

            this.deliver(WaitReport {
                service_id,
                role,
                kind: WaitKind::Cooldown,
                status: WaitStatus::Success { nodes: Vec::new() },
            });
        });
        Ok(())
    }

    /// Drop queued waits of a service and stop the running ones, cooldowns
    /// included.
    ///
    /// Stopped waits deliver no report. Waits queued afterwards are not
    /// affected.
    pub fn cancel(&self, service_id: ServiceId) -> usize {
        let dropped = self.dispatcher.cancel(service_id);
        let signal = self.lock_cancels().remove(&service_id);
        if let Some(tx) = signal {
            tx.send_replace(true);
        }
        info!(service = service_id, dropped, "waits cancelled");
        dropped
    }

    /// Number of node waits queued for a service.
    pub fn queued_for(&self, service_id: ServiceId) -> usize {
        self.dispatcher.queued_for(service_id)
    }

    /// Whether any wait or cooldown of the service is running.
    pub fn is_waiting(&self, service_id: ServiceId) -> bool {
        self.dispatcher.is_running(service_id) || self.cooldowns.is_active(service_id)
    }

    /// Resolve once no wait is queued or running and no cooldown is pending.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
        self.cooldowns.idle().await;
    }

    fn lock_cancels(&self) -> MutexGuard<'_, HashMap<ServiceId, watch::Sender<bool>>> {
        self.cancels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_receiver(&self, service_id: ServiceId) -> watch::Receiver<bool> {
        self.lock_cancels()
            .entry(service_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    async fn run(&self, action: WaitAction) {
        let WaitAction {
            service_id,
            role,
            kind,
            nodes,
        } = action;
        let mut cancel = self.cancel_receiver(service_id);
        debug!(service = service_id, role = %role, wait = kind.action_name(), ?nodes, "waiting for nodes");

        let status = match self.waiter.wait_for(&nodes, kind.target(), &mut cancel).await {
            Ok(outcome) if outcome.success() => WaitStatus::Success {
                nodes: outcome.resolved,
            },
            Ok(outcome) => WaitStatus::Failed {
                reason: format!(
                    "nodes {:?} failed to reach {}",
                    outcome.failed,
                    kind.target()
                ),
                nodes: outcome.failed,
            },
            Err(WaitError::Cancelled) => {
                info!(service = service_id, role = %role, wait = kind.action_name(), "wait cancelled");
                return;
            }
            Err(WaitError::Bus(e)) => {
                warn!(service = service_id, role = %role, error = %e, "wait aborted by bus error");
                WaitStatus::Failed {
                    nodes: Vec::new(),
                    reason: e.to_string(),
                }
            }
        };

        self.deliver(WaitReport {
            service_id,
            role,
            kind,
            status,
        });
    }

    fn deliver(&self, report: WaitReport) {
        info!(
            service = report.service_id,
            role = %report.role,
            wait = report.kind.action_name(),
            success = report.is_success(),
            "wait finished"
        );
        match &self.callback {
            Some(callback) => callback(report),
            None => warn!(service = report.service_id, "no wait callback registered, report dropped"),
        }
    }
}
