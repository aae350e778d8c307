//! Persistence hook for saga checkpoints and execution leases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;

use forgeflow_core::SagaId;

use crate::types::{SagaState, SagaStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SagaStoreError {
    /// A newer copy of the state was saved by someone else.
    #[error("version conflict for saga {saga_id}: stored {stored}, attempted {attempted}")]
    Conflict {
        saga_id: SagaId,
        stored: u64,
        attempted: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Saga state storage.
///
/// `save` must be atomic per saga: a reader sees either the previous or the
/// new state, never a mix. Implementations reject a save whose `version` is
/// not newer than the stored one.
///
/// Leases keep one orchestrator per saga. A lease expires after its ttl so a
/// crashed owner does not block the saga forever; the same owner acquiring
/// again renews it.
pub trait SagaStore: Send + Sync {
    fn save(&self, state: &SagaState) -> Result<(), SagaStoreError>;

    fn load(&self, saga_id: SagaId) -> Result<Option<SagaState>, SagaStoreError>;

    /// All sagas, optionally filtered by status, oldest first.
    fn list(&self, status: Option<SagaStatus>) -> Result<Vec<SagaState>, SagaStoreError>;

    fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, SagaStoreError>;

    /// Release a lease; a no-op unless `owner` holds it.
    fn release_lease(&self, saga_id: SagaId, owner: &str) -> Result<(), SagaStoreError>;
}

impl<S: SagaStore + ?Sized> SagaStore for Arc<S> {
    fn save(&self, state: &SagaState) -> Result<(), SagaStoreError> {
        (**self).save(state)
    }

    fn load(&self, saga_id: SagaId) -> Result<Option<SagaState>, SagaStoreError> {
        (**self).load(saga_id)
    }

    fn list(&self, status: Option<SagaStatus>) -> Result<Vec<SagaState>, SagaStoreError> {
        (**self).list(status)
    }

    fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, SagaStoreError> {
        (**self).try_acquire_lease(saga_id, owner, ttl)
    }

    fn release_lease(&self, saga_id: SagaId, owner: &str) -> Result<(), SagaStoreError> {
        (**self).release_lease(saga_id, owner)
    }
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-memory saga store.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    states: RwLock<HashMap<SagaId, SagaState>>,
    leases: Mutex<HashMap<SagaId, Lease>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current lease holder, if the lease has not expired.
    pub fn lease_owner(&self, saga_id: SagaId) -> Option<String> {
        let leases = self.leases.lock().unwrap();
        leases
            .get(&saga_id)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.owner.clone())
    }
}

fn poisoned() -> SagaStoreError {
    SagaStoreError::Storage("lock poisoned".to_string())
}

impl SagaStore for InMemorySagaStore {
    fn save(&self, state: &SagaState) -> Result<(), SagaStoreError> {
        let mut states = self.states.write().map_err(|_| poisoned())?;
        if let Some(existing) = states.get(&state.saga_id) {
            if existing.version >= state.version {
                return Err(SagaStoreError::Conflict {
                    saga_id: state.saga_id,
                    stored: existing.version,
                    attempted: state.version,
                });
            }
        }
        states.insert(state.saga_id, state.clone());
        Ok(())
    }

    fn load(&self, saga_id: SagaId) -> Result<Option<SagaState>, SagaStoreError> {
        let states = self.states.read().map_err(|_| poisoned())?;
        Ok(states.get(&saga_id).cloned())
    }

    fn list(&self, status: Option<SagaStatus>) -> Result<Vec<SagaState>, SagaStoreError> {
        let states = self.states.read().map_err(|_| poisoned())?;
        let mut out: Vec<SagaState> = states
            .values()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.created_at, s.saga_id));
        Ok(out)
    }

    fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, SagaStoreError> {
        let mut leases = self.leases.lock().map_err(|_| poisoned())?;
        let now = Instant::now();

        if let Some(lease) = leases.get(&saga_id) {
            if lease.owner != owner && lease.expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(
            saga_id,
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn release_lease(&self, saga_id: SagaId, owner: &str) -> Result<(), SagaStoreError> {
        let mut leases = self.leases.lock().map_err(|_| poisoned())?;
        if leases.get(&saga_id).is_some_and(|l| l.owner == owner) {
            leases.remove(&saga_id);
        }
        Ok(())
    }
}
