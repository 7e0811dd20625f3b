//! redb table definitions for the service store.

use redb::TableDefinition;

/// Service documents keyed by service id.
pub const SERVICES: TableDefinition<u64, &[u8]> = TableDefinition::new("services");

/// Store bookkeeping (id counters).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the next service id to hand out.
pub const NEXT_SERVICE_ID: &str = "next_service_id";
