//! svcflow-dispatch — asynchronous named-action execution.
//!
//! A [`Dispatcher`] owns a queue of actions and a fixed pool of worker
//! tasks. Each action names the handler that runs it and the entity it
//! belongs to. With [`Exclusion::PerEntity`] (the default) two actions for
//! the same entity never run at the same time and run in submission order;
//! actions for different entities run in parallel up to the pool size.
//!
//! ```text
//! submit(action) ──► queue ──► worker 0..N ──► handlers[action.name()]
//!                      ▲
//!  cancel(entity) ─────┘ (drops queued, never running, actions)
//! ```
//!
//! The dispatcher never retries: a handler error is logged and dropped.

pub mod dispatcher;
pub mod error;

pub use dispatcher::{Action, Dispatcher, EntityId, Exclusion, Handler, HandlerFuture};
pub use error::{DispatchError, DispatchResult};
