//! Scaling a role and the cooldown that follows.

use tracing::{debug, info, warn};

use svcflow_events::WaitKind;
use svcflow_state::{NodeId, NodeStatus, RoleState, ScaleDirection, Service, ServiceId, ServiceState};

use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::{LifecycleManager, role_mut};

/// Derive the service state from its roles while a scale is in progress.
pub(crate) fn settle_scaling(svc: &mut Service) {
    if !matches!(svc.state, ServiceState::Scaling | ServiceState::Cooldown) {
        return;
    }
    let next = if svc.any_role_in(RoleState::Scaling) {
        ServiceState::Scaling
    } else if svc.any_role_in(RoleState::Cooldown) {
        ServiceState::Cooldown
    } else {
        ServiceState::Running
    };
    svc.set_state(next);
}

impl LifecycleManager {
    /// Change a role's cardinality.
    ///
    /// Without `force` only a RUNNING or WARNING service scales. With it,
    /// anything but PENDING, DONE and the deletion states.
    pub async fn scale(
        &self,
        service_id: ServiceId,
        role_name: &str,
        cardinality: u32,
        force: bool,
    ) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let allowed = if force {
            !matches!(
                svc.state,
                ServiceState::Pending
                    | ServiceState::Done
                    | ServiceState::Deleting
                    | ServiceState::FailedDeleting
            )
        } else {
            matches!(svc.state, ServiceState::Running | ServiceState::Warning)
        };
        if !allowed {
            return Err(LifecycleError::InvalidState {
                action: "scale",
                service: service_id,
                state: svc.state,
            });
        }

        let current = role_mut(&mut svc, role_name)?.cardinality;
        let diff = i64::from(cardinality) - i64::from(current);
        if diff == 0 {
            debug!(service = service_id, role = role_name, cardinality, "cardinality unchanged");
            return Ok(());
        }

        info!(service = service_id, role = role_name, from = current, to = cardinality, "scaling role");
        svc.log_info(&format!(
            "Scaling role {role_name} from {current} to {cardinality} nodes"
        ));

        let role = role_mut(&mut svc, role_name)?;
        role.cardinality = cardinality;

        let (kind, nodes) = if diff > 0 {
            role.scale_direction = Some(ScaleDirection::Up);
            let missing = role.missing_nodes();
            let (deployed, error) = self.deploy_nodes(&svc, role_name, missing).await;
            let role = role_mut(&mut svc, role_name)?;
            role.add_nodes(&deployed, NodeStatus::Deploying);
            if let Some(e) = error {
                role.set_state(RoleState::FailedScaling);
                svc.set_state(ServiceState::FailedScaling);
                svc.log_error(&format!("Error scaling up role {role_name}: {e}"));
                svc.commit()?;
                return Err(e.into());
            }
            (WaitKind::ScaleUp, deployed)
        } else {
            role.scale_direction = Some(ScaleDirection::Down);
            let victims = role.scale_down_candidates();
            let hard = svc
                .role(role_name)
                .map(|r| svc.shutdown_action_for(r, self.inner.settings.shutdown_action))
                .unwrap_or(self.inner.settings.shutdown_action)
                .is_hard();

            let outcome = self.shutdown_nodes(&victims, hard).await;
            let role = role_mut(&mut svc, role_name)?;
            outcome.apply(role);
            if let Some(e) = outcome.error {
                role.set_state(RoleState::FailedScaling);
                svc.set_state(ServiceState::FailedScaling);
                svc.log_error(&format!("Error scaling down role {role_name}: {e}"));
                svc.commit()?;
                return Err(e.into());
            }
            (WaitKind::ScaleDown, outcome.issued)
        };

        role_mut(&mut svc, role_name)?.set_state(RoleState::Scaling);
        svc.set_state(ServiceState::Scaling);
        svc.commit()?;
        self.register_waits(service_id, kind, vec![(role_name.to_string(), nodes)]);
        Ok(())
    }

    /// A scale wait finished: start the role's cooldown.
    pub(crate) async fn scale_cb(
        &self,
        service_id: ServiceId,
        role_name: &str,
        nodes: &[NodeId],
        kind: WaitKind,
    ) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let role = role_mut(&mut svc, role_name)?;
        if role.state != RoleState::Scaling {
            debug!(service = service_id, role = role_name, state = %role.state, "stale scale callback");
            return Ok(());
        }

        match kind {
            WaitKind::ScaleDown => role.remove_nodes(nodes),
            _ => role.mark_nodes(nodes, NodeStatus::Running),
        }
        role.scale_direction = None;
        role.set_state(RoleState::Cooldown);
        let period = self.cooldown_for(role);

        settle_scaling(&mut svc);
        svc.commit()?;

        debug!(service = service_id, role = role_name, ?period, "role cooling down");
        if let Err(e) = self.inner.events.wait_cooldown(service_id, role_name, period) {
            warn!(service = service_id, role = role_name, error = %e, "cannot register cooldown");
        }
        Ok(())
    }

    pub(crate) async fn scale_failure_cb(
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
        role.set_state(RoleState::FailedScaling);
        svc.set_state(ServiceState::FailedScaling);
        svc.log_error(&format!("Error scaling role {role_name}: {reason}"));
        svc.commit()?;
        Ok(())
    }

    pub(crate) async fn cooldown_cb(
        &self,
        service_id: ServiceId,
        role_name: &str,
    ) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let role = role_mut(&mut svc, role_name)?;
        if role.state != RoleState::Cooldown {
            debug!(service = service_id, role = role_name, state = %role.state, "stale cooldown callback");
            return Ok(());
        }
        role.scale_direction = None;
        role.set_state(RoleState::Running);
        info!(service = service_id, role = role_name, "cooldown finished");

        settle_scaling(&mut svc);
        svc.commit()?;
        Ok(())
    }
}
