//! Delete, owner, permission and name updates, and scheduled node actions.

use std::time::Duration;

use tracing::{debug, info, warn};

use svcflow_backend::NodeAction;
use svcflow_events::WaitKind;
use svcflow_state::{
    NodeId, NodeStatus, RoleState, Service, ServiceGuard, ServiceId, ServiceState,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::{LifecycleManager, role_mut};

/// Live node ids across every role.
fn live_nodes(svc: &Service) -> Vec<NodeId> {
    svc.roles
        .iter()
        .flat_map(|r| r.nodes.iter())
        .filter(|n| n.status.is_live())
        .map(|n| n.deploy_id)
        .collect()
}

impl LifecycleManager {
    // ── Delete ─────────────────────────────────────────────────────

    /// Shut everything down and remove the service document.
    pub async fn delete(&self, service_id: ServiceId) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        if svc.state == ServiceState::Deleting {
            debug!(service = service_id, "delete already in progress");
            return Ok(());
        }

        self.cancel_pending(service_id);
        svc.set_state(ServiceState::Deleting);
        info!(service = service_id, "deleting service");

        let default = self.inner.settings.shutdown_action;
        let names: Vec<String> = svc.roles.iter().map(|r| r.name.clone()).collect();
        let mut waits = Vec::new();

        for name in names {
            let nodes = role_mut(&mut svc, &name)?.node_ids();
            if nodes.is_empty() {
                role_mut(&mut svc, &name)?.set_state(RoleState::Done);
                continue;
            }

            let hard = self.inner.settings.force_deletion
                || svc
                    .role(&name)
                    .map(|r| svc.shutdown_action_for(r, default))
                    .unwrap_or(default)
                    .is_hard();
            let outcome = self.shutdown_nodes(&nodes, hard).await;
            let role = role_mut(&mut svc, &name)?;
            outcome.apply(role);

            if let Some(e) = outcome.error {
                role.set_state(RoleState::FailedDeleting);
                svc.set_state(ServiceState::FailedDeleting);
                svc.log_error(&format!("Error deleting role {name}: {e}"));
                svc.commit()?;
                self.register_waits(service_id, WaitKind::Delete, waits);
                return Err(e.into());
            }

            if role.nodes.is_empty() {
                role.set_state(RoleState::Done);
            } else {
                role.set_state(RoleState::Deleting);
                waits.push((name, role.node_ids_with(NodeStatus::ShuttingDown)));
            }
        }

        if svc.all_roles_done() {
            return self.finish_delete(svc).await;
        }
        svc.commit()?;
        self.register_waits(service_id, WaitKind::Delete, waits);
        Ok(())
    }

    pub(crate) async fn delete_cb(
        &self,
        service_id: ServiceId,
        role_name: &str,
        nodes: &[NodeId],
    ) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let role = role_mut(&mut svc, role_name)?;
        if role.state != RoleState::Deleting {
            debug!(service = service_id, role = role_name, state = %role.state, "stale delete callback");
            return Ok(());
        }
        role.remove_nodes(nodes);
        role.set_state(RoleState::Done);

        if svc.all_roles_done() && svc.state == ServiceState::Deleting {
            return self.finish_delete(svc).await;
        }
        svc.commit()?;
        Ok(())
    }

    pub(crate) async fn delete_failure_cb(
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
        role.set_state(RoleState::FailedDeleting);
        svc.set_state(ServiceState::FailedDeleting);
        svc.log_error(&format!("Error deleting role {role_name}: {reason}"));
        svc.commit()?;
        Ok(())
    }

    async fn finish_delete(&self, mut svc: ServiceGuard) -> LifecycleResult<()> {
        if let Err(e) = self.delete_networks(&mut svc).await {
            svc.set_state(ServiceState::FailedDeleting);
            svc.log_error(&format!("Error deleting networks: {e}"));
            svc.commit()?;
            return Err(e.into());
        }
        let id = svc.id;
        svc.remove()?;
        info!(service = id, "service deleted");
        Ok(())
    }

    // ── Metadata ───────────────────────────────────────────────────

    /// Change the owner of the service and of every live node.
    ///
    /// A node that refuses the change rolls the nodes already changed back
    /// to the previous owner.
    pub async fn chown(&self, service_id: ServiceId, uid: u32, gid: u32) -> LifecycleResult<()> {
        self.change_owner(service_id, Some(uid), gid).await
    }

    /// Change only the group, keeping the owner uid.
    pub async fn chgrp(&self, service_id: ServiceId, gid: u32) -> LifecycleResult<()> {
        self.change_owner(service_id, None, gid).await
    }

    async fn change_owner(
        &self,
        service_id: ServiceId,
        uid: Option<u32>,
        gid: u32,
    ) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let (old_uid, old_gid) = (svc.owner.uid, svc.owner.gid);
        let new_uid = uid.unwrap_or(old_uid);

        let mut changed = Vec::new();
        for node in live_nodes(&svc) {
            match self.inner.backend.chown(node, new_uid, gid).await {
                Ok(()) => changed.push(node),
                Err(e) => {
                    warn!(service = service_id, node, error = %e, "chown failed, rolling back");
                    for &done in &changed {
                        if let Err(e) = self.inner.backend.chown(done, old_uid, old_gid).await {
                            warn!(service = service_id, node = done, error = %e, "chown rollback failed");
                        }
                    }
                    svc.log_error(&format!("Error changing owner of node {node}: {e}"));
                    svc.commit()?;
                    return Err(e.into());
                }
            }
        }

        svc.owner.uid = new_uid;
        svc.owner.gid = gid;
        match uid {
            Some(_) => svc.log_info(&format!("Owner changed to {new_uid}:{gid}")),
            None => svc.log_info(&format!("Group changed to {gid}")),
        }
        svc.commit()?;
        Ok(())
    }

    /// Change the permission octet of the service and of every live node.
    pub async fn chmod(&self, service_id: ServiceId, permissions: &str) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;

        for node in live_nodes(&svc) {
            if let Err(e) = self.inner.backend.chmod(node, permissions).await {
                warn!(service = service_id, node, error = %e, "chmod failed");
                svc.log_error(&format!("Error changing permissions of node {node}: {e}"));
                svc.commit()?;
                return Err(e.into());
            }
        }

        svc.owner.permissions = permissions.to_string();
        svc.log_info(&format!("Permissions changed to {permissions}"));
        svc.commit()?;
        Ok(())
    }

    // ── Scheduled node actions ─────────────────────────────────────

    /// Schedule `action` on the live nodes of a role, `number` nodes at a
    /// time with `period` seconds between batches.
    ///
    /// With neither given the configured defaults apply. A missing
    /// `number` alone means a single batch; a missing `period` alone means
    /// every batch is due now. The backend runs the actions; the service
    /// and role states are left as they are.
    pub async fn sched_action(
        &self,
        service_id: ServiceId,
        role_name: &str,
        action: NodeAction,
        period: Option<u64>,
        number: Option<u32>,
    ) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        if !matches!(svc.state, ServiceState::Running | ServiceState::Warning) {
            return Err(LifecycleError::InvalidState {
                action: "sched_action",
                service: service_id,
                state: svc.state,
            });
        }

        let (period, number) = match (period, number) {
            (None, None) => (
                self.inner.settings.action_period_secs,
                Some(self.inner.settings.action_number),
            ),
            (period, number) => (period.unwrap_or(0), number),
        };
        if number == Some(0) {
            return Err(LifecycleError::InvalidRequest(
                "number of nodes per batch must be at least 1".to_string(),
            ));
        }

        let nodes: Vec<NodeId> = role_mut(&mut svc, role_name)?
            .nodes
            .iter()
            .filter(|n| n.status.is_live())
            .map(|n| n.deploy_id)
            .collect();
        let batch = number.map_or(nodes.len(), |n| n as usize).max(1);

        for (i, chunk) in nodes.chunks(batch).enumerate() {
            let after = Duration::from_secs(period * i as u64);
            for &node in chunk {
                if let Err(e) = self.inner.backend.schedule_action(node, action, after).await {
                    warn!(service = service_id, node, %action, error = %e, "cannot schedule action");
                    svc.log_error(&format!("Error scheduling {action} on node {node}: {e}"));
                    svc.commit()?;
                    return Err(e.into());
                }
            }
        }

        info!(service = service_id, role = role_name, %action, nodes = nodes.len(), period, batch, "node action scheduled");
        svc.log_info(&format!(
            "Action {action} scheduled on {} nodes of role {role_name}",
            nodes.len()
        ));
        svc.commit()?;
        Ok(())
    }

    pub async fn rename(&self, service_id: ServiceId, name: &str) -> LifecycleResult<()> {
        let mut svc = self.inner.pool.lock(service_id).await?;
        let old = std::mem::replace(&mut svc.name, name.to_string());
        svc.log_info(&format!("Renamed from {old} to {name}"));
        svc.commit()?;
        Ok(())
    }
}
