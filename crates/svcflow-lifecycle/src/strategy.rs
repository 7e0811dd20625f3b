//! Deployment strategies: which roles an operation acts on next.

use svcflow_state::{RoleState, Service, Strategy};

/// Picks the roles a deploy or undeploy step touches.
pub trait DeploymentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Roles to deploy now, in declaration order.
    fn roles_to_deploy(&self, service: &Service) -> Vec<String>;

    /// Roles to shut down now.
    fn roles_to_shutdown(&self, service: &Service) -> Vec<String>;

    /// Whether a finished role step should re-trigger the operation.
    fn resubmits(&self) -> bool;
}

/// Strategy implementation for a persisted strategy field.
pub fn for_service(strategy: Strategy) -> &'static dyn DeploymentStrategy {
    match strategy {
        Strategy::Straight => &Straight,
        Strategy::Parallel => &Parallel,
    }
}

fn wants_deploy(state: RoleState) -> bool {
    matches!(state, RoleState::Pending | RoleState::Deploying)
}

fn parents_running(service: &Service, parents: &[String]) -> bool {
    parents.iter().all(|p| {
        service
            .role(p)
            .is_some_and(|r| r.state == RoleState::Running)
    })
}

/// One role at a time: deploy in declaration order once every parent runs,
/// undeploy in reverse declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Straight;

impl DeploymentStrategy for Straight {
    fn name(&self) -> &'static str {
        "straight"
    }

    fn roles_to_deploy(&self, service: &Service) -> Vec<String> {
        if let Some(current) = service.roles.iter().find(|r| r.state == RoleState::Deploying) {
            return vec![current.name.clone()];
        }
        service
            .roles
            .iter()
            .find(|r| r.state == RoleState::Pending && parents_running(service, &r.parents))
            .map(|r| vec![r.name.clone()])
            .unwrap_or_default()
    }

    fn roles_to_shutdown(&self, service: &Service) -> Vec<String> {
        service
            .roles
            .iter()
            .rev()
            .find(|r| r.state != RoleState::Done)
            .map(|r| vec![r.name.clone()])
            .unwrap_or_default()
    }

    fn resubmits(&self) -> bool {
        true
    }
}

/// Every eligible role at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Parallel;

impl DeploymentStrategy for Parallel {
    fn name(&self) -> &'static str {
        "none"
    }

    fn roles_to_deploy(&self, service: &Service) -> Vec<String> {
        service
            .roles
            .iter()
            .filter(|r| wants_deploy(r.state))
            .map(|r| r.name.clone())
            .collect()
    }

    fn roles_to_shutdown(&self, service: &Service) -> Vec<String> {
        service
            .roles
            .iter()
            .filter(|r| r.state != RoleState::Done)
            .map(|r| r.name.clone())
            .collect()
    }

    fn resubmits(&self) -> bool {
        false
    }
}
