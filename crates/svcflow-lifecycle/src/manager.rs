//! LifecycleManager: deploy and undeploy, plus the plumbing shared by
//! every operation.
//!
//! Scaling and cooldown live in `scale.rs`, recover and catch-up in
//! `recovery.rs`, delete and the metadata updates in `admin.rs`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use svcflow_backend::{BackendError, ComputeBackend, NetworkSpec, NodeSpec};
use svcflow_core::{FlowConfig, LifecycleConfig};
use svcflow_dispatch::Dispatcher;
use svcflow_events::{EventManager, EventSource, WaitKind, WaitReport};
use svcflow_state::{
    NodeId, NodeStatus, Role, RoleState, Service, ServiceGuard, ServiceId, ServicePool,
    ServiceState, StateError,
};

use crate::action::LifecycleAction;
use crate::error::{LifecycleError, LifecycleResult};
use crate::strategy;

pub(crate) struct Inner {
    pub(crate) pool: ServicePool,
    pub(crate) backend: Arc<dyn ComputeBackend>,
    pub(crate) events: EventManager,
    pub(crate) dispatcher: Dispatcher<LifecycleAction>,
    pub(crate) settings: LifecycleConfig,
}

/// Drives services through their lifecycle.
///
/// Cheap to clone; all clones share one dispatcher and one event manager.
#[derive(Clone)]
pub struct LifecycleManager {
    pub(crate) inner: Arc<Inner>,
}

/// Result of shutting down a batch of nodes.
#[derive(Debug, Default)]
pub(crate) struct ShutdownOutcome {
    /// Shutdown accepted, node still to converge.
    pub issued: Vec<NodeId>,
    /// Backend no longer knows the node.
    pub gone: Vec<NodeId>,
    /// First hard failure; nodes after it were not attempted.
    pub error: Option<BackendError>,
}

impl ShutdownOutcome {
    /// Record the outcome on a role's node list.
    pub fn apply(&self, role: &mut Role) {
        role.mark_nodes(&self.issued, NodeStatus::ShuttingDown);
        role.remove_nodes(&self.gone);
    }
}

/// Look a role up by name for mutation.
pub(crate) fn role_mut<'a>(
    service: &'a mut Service,
    role: &str,
) -> LifecycleResult<&'a mut Role> {
    let id = service.id;
    service
        .role_mut(role)
        .ok_or_else(|| LifecycleError::RoleNotFound {
            service: id,
            role: role.to_string(),
        })
}

impl LifecycleManager {
    pub fn new(
        pool: ServicePool,
        backend: Arc<dyn ComputeBackend>,
        source: Arc<dyn EventSource>,
        config: &FlowConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new("lifecycle", config.dispatcher.concurrency);

        let callbacks = dispatcher.clone();
        let events = EventManager::new(source, Arc::clone(&backend), &config.events).with_callback(
            Arc::new(move |report: WaitReport| {
                let service_id = report.service_id;
                if let Err(e) = callbacks.submit(LifecycleAction::from(report)) {
                    warn!(service = service_id, error = %e, "dropping wait callback");
                }
            }),
        );

        let inner = Arc::new(Inner {
            pool,
            backend,
            events,
            dispatcher,
            settings: config.lifecycle.clone(),
        });

        for name in LifecycleAction::NAMES {
            let weak = Arc::downgrade(&inner);
            inner.dispatcher.register(name, move |action: LifecycleAction| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => LifecycleManager { inner }
                            .handle(action)
                            .await
                            .map_err(anyhow::Error::from),
                        None => Ok(()),
                    }
                }
            });
        }

        Self { inner }
    }

    /// Spawn the wait and lifecycle workers.
    pub fn start(&self) {
        self.inner.events.start();
        self.inner.dispatcher.start();
        info!(
            default_cooldown = ?self.inner.settings.default_cooldown(),
            shutdown_action = %self.inner.settings.shutdown_action,
            "lifecycle manager started"
        );
    }

    /// Stop both dispatchers. Running handlers finish; queued work is dropped.
    pub async fn shutdown(&self) {
        self.inner.dispatcher.shutdown().await;
        self.inner.events.shutdown().await;
        info!("lifecycle manager stopped");
    }

    /// Queue an action on the service's lane.
    pub fn trigger(&self, action: LifecycleAction) -> LifecycleResult<()> {
        self.inner.dispatcher.submit(action)?;
        Ok(())
    }

    /// Store a new service document in `PENDING`.
    pub fn create_service(&self, service: Service) -> LifecycleResult<Service> {
        let service = self.inner.pool.store().allocate(service)?;
        info!(service = service.id, name = %service.name, "service created");
        Ok(service)
    }

    /// Snapshot of a stored service.
    pub fn service(&self, id: ServiceId) -> LifecycleResult<Option<Service>> {
        Ok(self.inner.pool.store().get_service(id)?)
    }

    pub fn pool(&self) -> &ServicePool {
        &self.inner.pool
    }

    pub fn events(&self) -> &EventManager {
        &self.inner.events
    }

    async fn handle(&self, action: LifecycleAction) -> LifecycleResult<()> {
        let is_callback = action.is_callback();
        let result = match action {
            LifecycleAction::Deploy { service_id } => self.deploy(service_id).await,
            LifecycleAction::Undeploy { service_id } => self.undeploy(service_id).await,
            LifecycleAction::Scale {
                service_id,
                role,
                cardinality,
                force,
            } => self.scale(service_id, &role, cardinality, force).await,
            LifecycleAction::Recover { service_id } => self.recover(service_id).await,
            LifecycleAction::Delete { service_id } => self.delete(service_id).await,
            LifecycleAction::Chown {
                service_id,
                uid,
                gid,
            } => self.chown(service_id, uid, gid).await,
            LifecycleAction::Chgrp { service_id, gid } => self.chgrp(service_id, gid).await,
            LifecycleAction::Chmod {
                service_id,
                permissions,
            } => self.chmod(service_id, &permissions).await,
            LifecycleAction::Rename { service_id, name } => self.rename(service_id, &name).await,
            LifecycleAction::SchedAction {
                service_id,
                role,
                action,
                period,
                number,
            } => {
                self.sched_action(service_id, &role, action, period, number)
                    .await
            }
            LifecycleAction::DeployCb {
                service_id,
                role,
                nodes,
            } => self.deploy_cb(service_id, &role, &nodes).await,
            LifecycleAction::DeployFailureCb {
                service_id,
                role,
                nodes,
                reason,
            } => self.deploy_failure_cb(service_id, &role, &nodes, &reason).await,
            LifecycleAction::UndeployCb {
                service_id,
                role,
                nodes,
            } => self.undeploy_cb(service_id, &role, &nodes).await,
            LifecycleAction::UndeployFailureCb {
                service_id,
                role,
                nodes,
                reason,
            } => self.undeploy_failure_cb(service_id, &role, &nodes, &reason).await,
            LifecycleAction::ScaleUpCb {
                service_id,
                role,
                nodes,
            } => self.scale_cb(service_id, &role, &nodes, WaitKind::ScaleUp).await,
            LifecycleAction::ScaleDownCb {
                service_id,
                role,
                nodes,
            } => self.scale_cb(service_id, &role, &nodes, WaitKind::ScaleDown).await,
            LifecycleAction::ScaleFailureCb {
                service_id,
                role,
                nodes,
                reason,
            } => self.scale_failure_cb(service_id, &role, &nodes, &reason).await,
            LifecycleAction::CooldownCb { service_id, role } => {
                self.cooldown_cb(service_id, &role).await
            }
            LifecycleAction::DeleteCb {
                service_id,
                role,
                nodes,
            } => self.delete_cb(service_id, &role, &nodes).await,
            LifecycleAction::DeleteFailureCb {
                service_id,
                role,
                nodes,
                reason,
            } => self.delete_failure_cb(service_id, &role, &nodes, &reason).await,
        };

        match result {
            // The service was deleted while its wait was in flight.
            Err(LifecycleError::State(StateError::NotFound(id))) if is_callback => {
                debug!(service = id, "callback for a removed service ignored");
                Ok(())
            }
            other => other,
        }
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Deploy the roles the strategy selects.
    pub async fn deploy(&self, service_id: ServiceId) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        if !matches!(
            svc.state,
            ServiceState::Pending | ServiceState::Deploying | ServiceState::Running
        ) {
            return Err(LifecycleError::InvalidState {
                action: "deploy",
                service: service_id,
                state: svc.state,
            });
        }

        let strategy = strategy::for_service(svc.strategy);
        let selected = strategy.roles_to_deploy(&svc);
        if selected.is_empty() && !svc.all_roles_running() {
            debug!(service = service_id, strategy = strategy.name(), "no role ready to deploy");
            return Ok(());
        }

        if let Err(e) = self.create_networks(&mut svc).await {
            svc.set_state(ServiceState::FailedDeploying);
            svc.log_error(&format!("Error creating networks: {e}"));
            svc.commit()?;
            return Err(e.into());
        }

        if selected.is_empty() {
            svc.set_state(ServiceState::Running);
            svc.commit()?;
            return Ok(());
        }

        svc.set_state(ServiceState::Deploying);
        let mut waits = Vec::new();
        let mut selected = selected;
        // A role with nothing to deploy settles at once and never produces a
        // callback, so keep selecting until something is left to wait on.
        while !selected.is_empty() {
            for name in selected {
                let (missing, outstanding) = {
                    let role = role_mut(&mut svc, &name)?;
                    (role.missing_nodes(), role.node_ids_with(NodeStatus::Deploying))
                };

                if missing == 0 && outstanding.is_empty() {
                    role_mut(&mut svc, &name)?.set_state(RoleState::Running);
                    continue;
                }

                let (deployed, error) = self.deploy_nodes(&svc, &name, missing).await;
                let role = role_mut(&mut svc, &name)?;
                role.add_nodes(&deployed, NodeStatus::Deploying);

                if let Some(e) = error {
                    role.set_state(RoleState::FailedDeploying);
                    svc.set_state(ServiceState::FailedDeploying);
                    svc.log_error(&format!("Error deploying role {name}: {e}"));
                    svc.commit()?;
                    // Roles dispatched before the failure still converge.
                    self.register_waits(service_id, WaitKind::Deploy, waits);
                    return Err(e.into());
                }

                role.set_state(RoleState::Deploying);
                waits.push((name, role.node_ids_with(NodeStatus::Deploying)));
            }

            selected = if waits.is_empty() && !svc.all_roles_running() {
                strategy.roles_to_deploy(&svc)
            } else {
                Vec::new()
            };
        }

        if svc.all_roles_running() {
            svc.set_state(ServiceState::Running);
        }
        svc.commit()?;
        self.register_waits(service_id, WaitKind::Deploy, waits);
        Ok(())
    }

    pub(crate) async fn deploy_cb(
        &self,
        service_id: ServiceId,
        role_name: &str,
        nodes: &[NodeId],
    ) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let role = role_mut(&mut svc, role_name)?;
        if role.state != RoleState::Deploying {
            debug!(service = service_id, role = role_name, state = %role.state, "stale deploy callback");
            return Ok(());
        }
        role.mark_nodes(nodes, NodeStatus::Running);
        role.set_state(RoleState::Running);
        info!(service = service_id, role = role_name, "role deployed");

        let resubmit = if svc.all_roles_running() {
            svc.set_state(ServiceState::Running);
            false
        } else {
            svc.state == ServiceState::Deploying && strategy::for_service(svc.strategy).resubmits()
        };
        svc.commit()?;

        if resubmit {
            self.trigger(LifecycleAction::Deploy { service_id })?;
        }
        Ok(())
    }

    pub(crate) async fn deploy_failure_cb(
        &self,
        service_id: ServiceId,
        role_name: &str,
        nodes: &[NodeId],
        reason: &str,
    ) -> LifecycleResult<()> {
        self.cancel_pending(service_id);

        let mut svc = self.inner.pool.lock(service_id).await?;
        let role = role_mut(&mut svc, role_name)?;
        role.mark_nodes(nodes, NodeStatus::Failed);
        role.set_state(RoleState::FailedDeploying);
        svc.set_state(ServiceState::FailedDeploying);
        svc.log_error(&format!("Error deploying role {role_name}: {reason}"));
        svc.commit()?;
        Ok(())
    }

    // ── Undeploy ───────────────────────────────────────────────────

    /// Shut down the roles the strategy selects.
    pub async fn undeploy(&self, service_id: ServiceId) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        if !matches!(
            svc.state,
            ServiceState::Running
                | ServiceState::Warning
                | ServiceState::Undeploying
                | ServiceState::FailedDeploying
                | ServiceState::FailedUndeploying
                | ServiceState::Pending
        ) {
            return Err(LifecycleError::InvalidState {
                action: "undeploy",
                service: service_id,
                state: svc.state,
            });
        }

        let strategy = strategy::for_service(svc.strategy);
        let selected = strategy.roles_to_shutdown(&svc);
        svc.set_state(ServiceState::Undeploying);

        let mut waits = Vec::new();
        let mut selected = selected;
        while !selected.is_empty() {
            for name in selected {
                let nodes = role_mut(&mut svc, &name)?.node_ids();
                if nodes.is_empty() {
                    role_mut(&mut svc, &name)?.set_state(RoleState::Done);
                    continue;
                }

                let hard = svc
                    .role(&name)
                    .map(|r| svc.shutdown_action_for(r, self.inner.settings.shutdown_action))
                    .unwrap_or(self.inner.settings.shutdown_action)
                    .is_hard();
                let outcome = self.shutdown_nodes(&nodes, hard).await;
                let role = role_mut(&mut svc, &name)?;
                outcome.apply(role);

                if let Some(e) = outcome.error {
                    role.set_state(RoleState::FailedUndeploying);
                    svc.set_state(ServiceState::FailedUndeploying);
                    svc.log_error(&format!("Error undeploying role {name}: {e}"));
                    svc.commit()?;
                    self.register_waits(service_id, WaitKind::Undeploy, waits);
                    return Err(e.into());
                }

                if role.nodes.is_empty() {
                    role.set_state(RoleState::Done);
                } else {
                    role.set_state(RoleState::Undeploying);
                    waits.push((name, role.node_ids_with(NodeStatus::ShuttingDown)));
                }
            }

            // Same as deploy: roles that finished on the spot yield no callback.
            selected = if waits.is_empty() {
                strategy.roles_to_shutdown(&svc)
            } else {
                Vec::new()
            };
        }

        if svc.all_roles_done() {
            return self.finish_undeploy(svc).await;
        }
        svc.commit()?;
        self.register_waits(service_id, WaitKind::Undeploy, waits);
        Ok(())
    }

    pub(crate) async fn undeploy_cb(
        &self,
        service_id: ServiceId,
        role_name: &str,
        nodes: &[NodeId],
    ) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let role = role_mut(&mut svc, role_name)?;
        if role.state != RoleState::Undeploying {
            debug!(service = service_id, role = role_name, state = %role.state, "stale undeploy callback");
            return Ok(());
        }
        role.remove_nodes(nodes);
        role.set_state(RoleState::Done);
        info!(service = service_id, role = role_name, "role undeployed");

        if svc.all_roles_done() {
            return self.finish_undeploy(svc).await;
        }

        let resubmit = svc.state == ServiceState::Undeploying
            && strategy::for_service(svc.strategy).resubmits();
        svc.commit()?;
        if resubmit {
            self.trigger(LifecycleAction::Undeploy { service_id })?;
        }
        Ok(())
    }

    pub(crate) async fn undeploy_failure_cb(
        &self,
        service_id: ServiceId,
        role_name: &str,
        nodes: &[NodeId],
        reason: &str,
    ) -> LifecycleResult<()> {
        self.cancel_pending(service_id);

        let mut svc = self.inner.pool.lock(service_id).await?;
        let role = role_mut(&mut svc, role_name)?;
        role.mark_nodes(nodes, NodeStatus::Failed);
        role.set_state(RoleState::FailedUndeploying);
        svc.set_state(ServiceState::FailedUndeploying);
        svc.log_error(&format!("Error undeploying role {role_name}: {reason}"));
        svc.commit()?;
        Ok(())
    }

    /// Every role is DONE: release the networks and close the service.
    async fn finish_undeploy(&self, mut svc: ServiceGuard) -> LifecycleResult<()> {
        if let Err(e) = self.delete_networks(&mut svc).await {
            svc.set_state(ServiceState::FailedUndeploying);
            svc.log_error(&format!("Error deleting networks: {e}"));
            svc.commit()?;
            return Err(e.into());
        }
        svc.set_state(ServiceState::Done);
        svc.commit()?;
        Ok(())
    }

    // ── Shared plumbing ────────────────────────────────────────────

    /// Drop queued actions and waits of a service. The running action is
    /// the caller and is not affected.
    pub(crate) fn cancel_pending(&self, service_id: ServiceId) {
        let actions = self.inner.dispatcher.cancel(service_id);
        let waits = self.inner.events.cancel(service_id);
        debug!(service = service_id, actions, waits, "pending work cancelled");
    }

    pub(crate) fn register_waits(
        &self,
        service_id: ServiceId,
        kind: WaitKind,
        waits: Vec<(String, Vec<NodeId>)>,
    ) {
        for (role, nodes) in waits {
            if let Err(e) = self.inner.events.wait_nodes(service_id, &role, kind, nodes) {
                warn!(service = service_id, role = %role, error = %e, "cannot register wait");
            }
        }
    }

    pub(crate) fn cooldown_for(&self, role: &Role) -> Duration {
        role.cooldown_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.inner.settings.default_cooldown())
    }

    /// Ask the backend for `count` more nodes of a role. Stops at the first
    /// error and returns what was created before it.
    pub(crate) async fn deploy_nodes(
        &self,
        service: &Service,
        role_name: &str,
        count: u32,
    ) -> (Vec<NodeId>, Option<BackendError>) {
        let Some(role) = service.role(role_name) else {
            return (Vec::new(), None);
        };

        let mut deployed = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let spec = NodeSpec::new(
                service.id,
                role_name,
                role.nodes.len() + i,
                role.template.clone(),
            );
            match self.inner.backend.deploy(&spec).await {
                Ok(node) => {
                    debug!(service = service.id, role = role_name, node, "node deployed");
                    deployed.push(node);
                }
                Err(e) => {
                    warn!(service = service.id, role = role_name, error = %e, "node deploy failed");
                    return (deployed, Some(e));
                }
            }
        }
        (deployed, None)
    }

    pub(crate) async fn shutdown_nodes(&self, nodes: &[NodeId], hard: bool) -> ShutdownOutcome {
        let mut outcome = ShutdownOutcome::default();
        for &node in nodes {
            match self.inner.backend.shutdown(node, hard).await {
                Ok(()) => outcome.issued.push(node),
                Err(e) if e.is_not_found() => {
                    debug!(node, "node already gone");
                    outcome.gone.push(node);
                }
                Err(e) => {
                    warn!(node, error = %e, "node shutdown failed");
                    outcome.error = Some(e);
                    break;
                }
            }
        }
        outcome
    }

    /// Create every owned network that has no backend id yet.
    async fn create_networks(&self, svc: &mut Service) -> Result<(), BackendError> {
        let service_id = svc.id;
        for net in svc.networks.iter_mut().filter(|n| n.network_id.is_none()) {
            let spec = NetworkSpec {
                service_id,
                name: net.name.clone(),
                template: net.template.clone(),
            };
            let id = self.inner.backend.create_network(&spec).await?;
            info!(service = service_id, network = %net.name, id, "network created");
            net.network_id = Some(id);
        }
        Ok(())
    }

    /// Delete every owned network that was created.
    pub(crate) async fn delete_networks(&self, svc: &mut Service) -> Result<(), BackendError> {
        let service_id = svc.id;
        for net in svc.networks.iter_mut() {
            let Some(id) = net.network_id else { continue };
            match self.inner.backend.delete_network(id).await {
                Ok(()) | Err(BackendError::NetworkNotFound(_)) => {
                    info!(service = service_id, network = %net.name, id, "network deleted");
                    net.network_id = None;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
