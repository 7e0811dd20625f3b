//! ServiceStore: redb-backed persistence for service documents.
//!
//! All values are JSON-serialized into redb's `&[u8]` value column. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). It is `Clone` and can be shared across tasks, but callers that
//! mutate a service must go through [`crate::ServicePool`].

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe service store backed by redb.
#[derive(Clone)]
pub struct ServiceStore {
    db: Arc<Database>,
    writes: Arc<AtomicU64>,
}

impl ServiceStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "service store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory service store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Document writes (inserts, overwrites, deletes) made through this
    /// store and its clones since it was opened.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Persist a new service, assigning its id and resetting it to PENDING.
    ///
    /// Id allocation and the insert share one write transaction.
    pub fn allocate(&self, mut service: Service) -> StateResult<Service> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let next = meta
                .get(NEXT_SERVICE_ID)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(1);
            meta.insert(NEXT_SERVICE_ID, next + 1)
                .map_err(map_err!(Write))?;

            service.id = next;
            service.state = ServiceState::Pending;
            for role in &mut service.roles {
                role.state = RoleState::Pending;
                role.nodes.clear();
                role.scale_direction = None;
            }

            let value = serde_json::to_vec(&service).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table
                .insert(service.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(service = service.id, name = %service.name, "service allocated");
        Ok(service)
    }

    /// Insert or overwrite a service document.
    pub fn put_service(&self, service: &Service) -> StateResult<()> {
        let value = serde_json::to_vec(service).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table
                .insert(service.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(service = service.id, state = %service.state, "service stored");
        Ok(())
    }

    pub fn get_service(&self, id: ServiceId) -> StateResult<Option<Service>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let service: Service =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(service))
            }
            None => Ok(None),
        }
    }

    /// List all services in id order.
    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let service: Service =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(service);
        }
        Ok(results)
    }

    /// Delete a service by id. Returns true if it existed.
    pub fn delete_service(&self, id: ServiceId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(service = id, existed, "service deleted");
        Ok(existed)
    }
}
