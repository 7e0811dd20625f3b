//! svcflow-lifecycle — the service lifecycle state machine.
//!
//! Every operation on a service (deploy, undeploy, scale, recover, delete
//! and the owner/name updates) is a [`LifecycleAction`] queued on a
//! dispatcher keyed by service id, so at most one runs per service. An
//! operation mutates the service document under its single-flight lock,
//! issues backend commands, commits, and then registers waits. Finished
//! waits come back as callback actions on the same queue.
//!
//! ```text
//! trigger(Deploy) ─► deploy ─► backend.deploy ─► wait_deploy ─┐
//!        ▲                                                     │
//!        └──── (straight) ◄── deploy_cb ◄── WaitReport ◄───────┘
//! ```

pub mod action;
pub mod error;
pub mod manager;
pub mod strategy;

mod admin;
mod recovery;
mod scale;

pub use action::LifecycleAction;
pub use error::{LifecycleError, LifecycleResult};
pub use manager::LifecycleManager;
pub use strategy::{DeploymentStrategy, Parallel, Straight};
