//! Single-flight access to service documents.
//!
//! Every read-modify-write of a service happens while holding a
//! [`ServiceGuard`]. The guard owns the per-id async mutex, so a second
//! caller for the same id waits until the first one commits or drops its
//! guard. Dropping a guard without calling [`ServiceGuard::commit`]
//! discards the working copy, which is how a handler bails out of a
//! critical section without writing.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::ServiceStore;
use crate::types::{Service, ServiceId};

type LockTable = HashMap<ServiceId, Arc<AsyncMutex<()>>>;

/// Serializes access to service documents by id.
#[derive(Clone)]
pub struct ServicePool {
    store: ServiceStore,
    locks: Arc<Mutex<LockTable>>,
}

impl ServicePool {
    pub fn new(store: ServiceStore) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read-only handle to the underlying store.
    pub fn store(&self) -> &ServiceStore {
        &self.store
    }

    /// Enter the critical section for `id` and fetch a working copy.
    ///
    /// Waits for any other holder of the same id. Fails with
    /// [`StateError::NotFound`] if the document does not exist.
    pub async fn lock(&self, id: ServiceId) -> StateResult<ServiceGuard> {
        let slot = self.slot(id);
        let permit = slot.lock_owned().await;

        let service = self
            .store
            .get_service(id)?
            .ok_or(StateError::NotFound(id))?;

        Ok(ServiceGuard {
            service,
            pool: self.clone(),
            _permit: permit,
        })
    }

    fn slot(&self, id: ServiceId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn forget(&self, id: ServiceId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&id);
    }
}

/// Exclusive working copy of one service.
pub struct ServiceGuard {
    service: Service,
    pool: ServicePool,
    _permit: OwnedMutexGuard<()>,
}

impl ServiceGuard {
    /// Write the working copy back, then release the lock.
    pub fn commit(self) -> StateResult<()> {
        self.pool.store.put_service(&self.service)
    }

    /// Delete the document, then release the lock.
    pub fn remove(self) -> StateResult<()> {
        let id = self.service.id;
        self.pool.store.delete_service(id)?;
        self.pool.forget(id);
        debug!(service = id, "service document removed");
        Ok(())
    }
}

impl Deref for ServiceGuard {
    type Target = Service;

    fn deref(&self) -> &Service {
        &self.service
    }
}

impl DerefMut for ServiceGuard {
    fn deref_mut(&mut self) -> &mut Service {
        &mut self.service
    }
}
