//! Lifecycle error types.

use thiserror::Error;

use svcflow_backend::BackendError;
use svcflow_dispatch::DispatchError;
use svcflow_state::{ServiceId, ServiceState, StateError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot {action} service {service} in state {state}")]
    InvalidState {
        action: &'static str,
        service: ServiceId,
        state: ServiceState,
    },

    #[error("recover not available for state {0}")]
    RecoverUnavailable(ServiceState),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("role {role} not found in service {service}")]
    RoleNotFound { service: ServiceId, role: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
