//! Recover from failed states, and catch up after a restart.

use tracing::{debug, info, warn};

use svcflow_dispatch::Action;
use svcflow_events::WaitKind;
use svcflow_state::{
    NodeId, NodeStatus, RoleState, ScaleDirection, Service, ServiceGuard, ServiceId,
    ServiceState,
};

use crate::action::LifecycleAction;
use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::{LifecycleManager, role_mut};

/// Failed variant of an in-flight state, for services whose waits died
/// with the previous process.
fn interrupted(state: ServiceState) -> Option<(ServiceState, RoleState, RoleState)> {
    match state {
        ServiceState::Deploying => Some((
            ServiceState::FailedDeploying,
            RoleState::Deploying,
            RoleState::FailedDeploying,
        )),
        ServiceState::Scaling => Some((
            ServiceState::FailedScaling,
            RoleState::Scaling,
            RoleState::FailedScaling,
        )),
        ServiceState::Undeploying => Some((
            ServiceState::FailedUndeploying,
            RoleState::Undeploying,
            RoleState::FailedUndeploying,
        )),
        ServiceState::Deleting => Some((
            ServiceState::FailedDeleting,
            RoleState::Deleting,
            RoleState::FailedDeleting,
        )),
        _ => None,
    }
}

impl LifecycleManager {
    /// Bring a failed (or cooling down, or degraded) service back on track.
    pub async fn recover(&self, service_id: ServiceId) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let state = svc.state;
        info!(service = service_id, %state, "recovering service");

        match state {
            ServiceState::FailedDeploying => {
                for name in svc.roles_in(RoleState::FailedDeploying) {
                    self.discard_failed_nodes(&mut svc, &name).await?;
                    role_mut(&mut svc, &name)?.set_state(RoleState::Pending);
                }
                svc.set_state(ServiceState::Deploying);
                svc.log_info("Recovering deployment");
                svc.commit()?;
                self.trigger(LifecycleAction::Deploy { service_id })
            }

            ServiceState::FailedScaling => self.recover_scaling(svc).await,

            ServiceState::FailedUndeploying => {
                for name in svc.roles_in(RoleState::FailedUndeploying) {
                    role_mut(&mut svc, &name)?.set_state(RoleState::Running);
                }
                svc.set_state(ServiceState::Undeploying);
                svc.log_info("Recovering undeployment");
                svc.commit()?;
                Ok(())
            }

            ServiceState::Cooldown => {
                self.inner.events.cancel(service_id);
                for role in svc.roles.iter_mut() {
                    if matches!(role.state, RoleState::Cooldown | RoleState::Scaling) {
                        role.set_state(RoleState::Running);
                    }
                    role.scale_direction = None;
                }
                svc.set_state(ServiceState::Running);
                svc.log_info("Cooldown period skipped");
                svc.commit()?;
                Ok(())
            }

            ServiceState::Warning => {
                let nodes: Vec<NodeId> = svc
                    .roles
                    .iter()
                    .filter(|r| r.state == RoleState::Warning)
                    .flat_map(|r| r.nodes.iter())
                    .filter(|n| n.status.is_live())
                    .map(|n| n.deploy_id)
                    .collect();

                for node in nodes {
                    if let Err(e) = self.inner.backend.recover_warning(node).await {
                        warn!(service = service_id, node, error = %e, "warning recovery failed");
                        svc.log_error(&format!("Error recovering node {node}: {e}"));
                    }
                }
                svc.commit()?;
                Ok(())
            }

            other => Err(LifecycleError::RecoverUnavailable(other)),
        }
    }

    /// Re-issue the interrupted scale of every FAILED_SCALING role.
    async fn recover_scaling(&self, mut svc: ServiceGuard) -> LifecycleResult<()> {
        let service_id = svc.id;
        let mut waits: Vec<(WaitKind, String, Vec<NodeId>)> = Vec::new();

        for name in svc.roles_in(RoleState::FailedScaling) {
            self.discard_failed_nodes(&mut svc, &name).await?;

            let (missing, excess, direction) = {
                let role = role_mut(&mut svc, &name)?;
                (role.missing_nodes(), role.excess_nodes(), role.scale_direction)
            };

            if missing > 0 {
                let (deployed, error) = self.deploy_nodes(&svc, &name, missing).await;
                let role = role_mut(&mut svc, &name)?;
                role.add_nodes(&deployed, NodeStatus::Deploying);
                if let Some(e) = error {
                    svc.log_error(&format!("Error scaling up role {name}: {e}"));
                    svc.commit()?;
                    return Err(e.into());
                }
                role.scale_direction = Some(ScaleDirection::Up);
                waits.push((
                    WaitKind::ScaleUp,
                    name.clone(),
                    role.node_ids_with(NodeStatus::Deploying),
                ));
            } else if excess > 0 {
                let victims = role_mut(&mut svc, &name)?.scale_down_candidates();
                let hard = svc
                    .role(&name)
                    .map(|r| svc.shutdown_action_for(r, self.inner.settings.shutdown_action))
                    .unwrap_or(self.inner.settings.shutdown_action)
                    .is_hard();
                let outcome = self.shutdown_nodes(&victims, hard).await;
                let role = role_mut(&mut svc, &name)?;
                outcome.apply(role);
                if let Some(e) = outcome.error {
                    svc.log_error(&format!("Error scaling down role {name}: {e}"));
                    svc.commit()?;
                    return Err(e.into());
                }
                role.scale_direction = Some(ScaleDirection::Down);
                waits.push((
                    WaitKind::ScaleDown,
                    name.clone(),
                    role.node_ids_with(NodeStatus::ShuttingDown),
                ));
            } else {
                let role = role_mut(&mut svc, &name)?;
                let wait = match direction {
                    Some(ScaleDirection::Down) => (
                        WaitKind::ScaleDown,
                        name.clone(),
                        role.node_ids_with(NodeStatus::ShuttingDown),
                    ),
                    _ => (
                        WaitKind::ScaleUp,
                        name.clone(),
                        role.node_ids_with(NodeStatus::Deploying),
                    ),
                };
                waits.push(wait);
            }

            role_mut(&mut svc, &name)?.set_state(RoleState::Scaling);
        }

        svc.set_state(ServiceState::Scaling);
        svc.log_info("Recovering scaling");
        svc.commit()?;

        for (kind, role, nodes) in waits {
            self.register_waits(service_id, kind, vec![(role, nodes)]);
        }
        Ok(())
    }

    /// Force off and forget the failed nodes of a role. Shutdown errors
    /// are logged and otherwise ignored.
    async fn discard_failed_nodes(&self, svc: &mut Service, role_name: &str) -> LifecycleResult<()> {
        let failed = role_mut(svc, role_name)?.node_ids_with(NodeStatus::Failed);
        if failed.is_empty() {
            return Ok(());
        }

        for &node in &failed {
            match self.inner.backend.shutdown(node, true).await {
                Ok(()) => debug!(service = svc.id, role = role_name, node, "failed node discarded"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(service = svc.id, role = role_name, node, error = %e, "cannot shut down failed node"),
            }
        }
        role_mut(svc, role_name)?.remove_nodes(&failed);
        Ok(())
    }

    /// Reconcile every stored service after a restart and queue the
    /// actions that resume interrupted work. Returns how many actions were
    /// queued.
    pub async fn catch_up(&self) -> LifecycleResult<usize> {
        let services = self.inner.pool.store().list_services()?;
        let mut submitted = 0;

        for stored in services {
            let service_id = stored.id;
            let mut svc = self.inner.pool.lock(service_id).await?;
            let original = svc.state;

            let current = match interrupted(original) {
                Some((failed, running_role, failed_role)) => {
                    for role in svc.roles.iter_mut().filter(|r| r.state == running_role) {
                        role.set_state(failed_role);
                    }
                    svc.set_state(failed);
                    svc.log_warning(&format!("Operation interrupted while {original}"));
                    warn!(service = service_id, state = %original, "interrupted operation found");
                    svc.commit()?;
                    failed
                }
                None => {
                    // Settled: release without writing.
                    drop(svc);
                    original
                }
            };

            let actions: Vec<LifecycleAction> = match (original, current) {
                (ServiceState::Undeploying, _) => vec![
                    LifecycleAction::Recover { service_id },
                    LifecycleAction::Undeploy { service_id },
                ],
                (ServiceState::Deleting, _) => vec![LifecycleAction::Delete { service_id }],
                (
                    _,
                    ServiceState::FailedDeploying
                    | ServiceState::FailedScaling
                    | ServiceState::FailedUndeploying
                    | ServiceState::Cooldown,
                ) => vec![LifecycleAction::Recover { service_id }],
                _ => Vec::new(),
            };

            for action in actions {
                debug!(service = service_id, action = action.name(), "catch-up action queued");
                self.trigger(action)?;
                submitted += 1;
            }
        }

        info!(submitted, "catch-up finished");
        Ok(submitted)
    }
}
