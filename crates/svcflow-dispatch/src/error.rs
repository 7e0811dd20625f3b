//! Dispatcher error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no handler registered for action {0}")]
    UnknownAction(String),

    #[error("dispatcher {0} is shut down")]
    ShutDown(&'static str),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
