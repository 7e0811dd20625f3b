//! Backend error types.

use std::time::Duration;

use thiserror::Error;

use svcflow_core::{NetworkId, NodeId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("network {0} not found")]
    NetworkNotFound(NetworkId),

    #[error("backend rejected request: {0}")]
    Rejected(String),

    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether the error means the node no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NodeNotFound(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
