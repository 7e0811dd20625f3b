//! svcflow-state — service documents and their store.
//!
//! Backed by [redb](https://docs.rs/redb), holds the authoritative copy of
//! every Service document. The lifecycle engine never writes the store
//! directly: it goes through [`ServicePool`], which serializes access per
//! service id.
//!
//! # Architecture
//!
//! Services are JSON-serialized into redb's `&[u8]` value column keyed by
//! their numeric id. A `meta` table holds the id counter used by
//! [`ServiceStore::allocate`].
//!
//! ```text
//! ServicePool
//!   ├── per-id async mutex (single flight)
//!   └── ServiceStore (redb)
//!         ├── services: id → Service JSON
//!         └── meta:     "next_service_id" → u64
//! ```

pub mod error;
pub mod pool;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use pool::{ServiceGuard, ServicePool};
pub use store::ServiceStore;
pub use types::*;
