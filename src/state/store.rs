//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every write is conditional: environment state on its revision, leases on
//! a [`LeaseCondition`]. Exactly one of several concurrent conditional writes
//! succeeds; the losers get [`StateError::Conflict`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::lock::{LeaseCondition, LockLease};

use super::types::{AuditEntry, EnvironmentState};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state of an environment.
    ///
    /// Returns `None` if the environment does not exist yet.
    async fn load(&self, scope: &str) -> Result<Option<EnvironmentState>>;

    /// Saves the state of an environment if the stored revision still equals
    /// `expected_revision` (0 means "must not exist yet").
    ///
    /// The caller is responsible for bumping `state.revision` to
    /// `expected_revision + 1` before saving.
    async fn save(&self, state: &EnvironmentState, expected_revision: u64) -> Result<()>;

    /// Deletes the state of an environment.
    async fn delete(&self, scope: &str) -> Result<()>;

    /// Checks if an environment exists.
    async fn exists(&self, scope: &str) -> Result<bool>;

    /// Reads the current lease of a scope, stale or not.
    async fn read_lease(&self, scope: &str) -> Result<Option<LockLease>>;

    /// Writes a lease if the condition holds against the stored lease.
    async fn write_lease(&self, lease: &LockLease, condition: &LeaseCondition) -> Result<()>;

    /// Deletes the lease of a scope if the condition holds.
    ///
    /// Returns whether a lease was deleted.
    async fn delete_lease(&self, scope: &str, condition: &LeaseCondition) -> Result<bool>;

    /// Appends an administrative audit entry.
    async fn append_audit(&self, scope: &str, entry: &AuditEntry) -> Result<()>;

    /// Lists audit entries, oldest first.
    async fn list_audit(&self, scope: &str) -> Result<Vec<AuditEntry>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Shared handle to a state store.
pub type SharedStateStore = Arc<dyn StateStore>;
