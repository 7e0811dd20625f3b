//! svcflow-events — waiting for nodes to converge.
//!
//! A wait subscribes to the exact state-change topic of every node it
//! watches and blocks on the bus. When the bus stays quiet for the
//! configured timeout, the backend is polled instead, so a lost event
//! only delays a wait, it never hangs it.
//!
//! ```text
//!                  ┌──────────── EventManager ────────────┐
//! wait_deploy ────►│ Dispatcher<WaitAction> (no exclusion) │──► WaitCallback
//!                  │   └── NodeWaiter                      │      (WaitReport)
//! wait_cooldown ──►│ spawned timers, outside the pool      │
//!                  └──────┬────────────────────┬──────────┘
//!                         │ subscribe / recv   │ query on timeout
//!                    EventSource          ComputeBackend
//! ```

pub mod bus;
pub mod error;
pub mod manager;
pub mod topic;
pub mod wait;

pub use bus::{BusMessage, EventSource, LocalBus, Subscription, TcpEventSource};
pub use error::{BusError, WaitError};
pub use manager::{EventManager, WaitAction, WaitCallback, WaitKind, WaitReport, WaitStatus};
pub use topic::NodeTopic;
pub use wait::{FAILURE_SUBSTATES, MAX_QUERY_FAILURES, NodeWaiter, WaitOutcome, is_failure};
