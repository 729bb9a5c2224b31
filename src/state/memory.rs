//! In-memory state storage backend.
//!
//! Everything lives behind one async mutex, which makes every conditional
//! write trivially atomic. Used for tests and for embedding the engine.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StateError};
use crate::lock::{LeaseCondition, LockLease};

use super::store::StateStore;
use super::types::{AuditEntry, EnvironmentState};

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<String, EnvironmentState>,
    leases: HashMap<String, LockLease>,
    audit: HashMap<String, Vec<AuditEntry>>,
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, scope: &str) -> Result<Option<EnvironmentState>> {
        Ok(self.inner.lock().await.states.get(scope).cloned())
    }

    async fn save(&self, state: &EnvironmentState, expected_revision: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.states.get(&state.environment).map_or(0, |s| s.revision);
        if stored != expected_revision {
            return Err(StateError::conflict(
                &state.environment,
                format!("expected revision {expected_revision}, found {stored}"),
            )
            .into());
        }
        inner.states.insert(state.environment.clone(), state.clone());
        debug!("Saved state for {} at revision {}", state.environment, state.revision);
        Ok(())
    }

    async fn delete(&self, scope: &str) -> Result<()> {
        self.inner.lock().await.states.remove(scope);
        Ok(())
    }

    async fn exists(&self, scope: &str) -> Result<bool> {
        Ok(self.inner.lock().await.states.contains_key(scope))
    }

    async fn read_lease(&self, scope: &str) -> Result<Option<LockLease>> {
        Ok(self.inner.lock().await.leases.get(scope).cloned())
    }

    async fn write_lease(&self, lease: &LockLease, condition: &LeaseCondition) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !condition.matches(inner.leases.get(&lease.scope)) {
            return Err(StateError::conflict(&lease.scope, "lease condition not met").into());
        }
        inner.leases.insert(lease.scope.clone(), lease.clone());
        Ok(())
    }

    async fn delete_lease(&self, scope: &str, condition: &LeaseCondition) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let current = inner.leases.get(scope);
        if current.is_none() || !condition.matches(current) {
            return Ok(false);
        }
        inner.leases.remove(scope);
        Ok(true)
    }

    async fn append_audit(&self, scope: &str, entry: &AuditEntry) -> Result<()> {
        self.inner
            .lock()
            .await
            .audit
            .entry(scope.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, scope: &str) -> Result<Vec<AuditEntry>> {
        Ok(self.inner.lock().await.audit.get(scope).cloned().unwrap_or_default())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
