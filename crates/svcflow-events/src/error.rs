//! Bus and wait error types.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("cannot connect to event publisher {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("event bus read failed: {0}")]
    Transport(String),

    #[error("event bus closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("wait cancelled")]
    Cancelled,
}
