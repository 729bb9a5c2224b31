//! Write-through view of one environment's state during a run.
//!
//! Workers never write the store directly. Each change goes through
//! [`StateLedger::update`], which applies it to a copy, bumps the revision,
//! and saves it conditionally on the previous revision. The in-memory copy
//! only advances once the store accepted the write.

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StateError};
use crate::state::{EnvironmentState, SharedStateStore};

/// Serialized, persisted mutations of an [`EnvironmentState`].
pub struct StateLedger {
    store: SharedStateStore,
    state: Mutex<EnvironmentState>,
}

impl std::fmt::Debug for StateLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLedger")
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

impl StateLedger {
    /// Loads the environment's state, or starts an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn open(store: SharedStateStore, environment: &str) -> Result<Self> {
        let state = match store.load(environment).await? {
            Some(state) => state,
            None => {
                debug!("No state for '{environment}' yet");
                EnvironmentState::new(environment)
            }
        };
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Applies `change` and persists the result.
    ///
    /// # Errors
    ///
    /// Returns the change's own error, or a store error (including
    /// [`StateError::Conflict`] if someone else wrote in between).
    pub async fn update<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut EnvironmentState) -> std::result::Result<T, StateError>,
    {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let value = change(&mut next)?;

        let expected = guard.revision;
        next.revision = expected + 1;
        next.last_updated = chrono::Utc::now();
        self.store.save(&next, expected).await?;

        *guard = next;
        Ok(value)
    }

    /// Moves records left mid-operation to `Failed` and persists if any were.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be saved.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let needs_recovery = self
            .state
            .lock()
            .await
            .records
            .values()
            .any(|r| r.status.is_transitional());
        if !needs_recovery {
            return Ok(Vec::new());
        }

        let recovered = self.update(|state| Ok(state.recover_interrupted())).await?;
        info!("Recovered {} interrupted record(s): {}", recovered.len(), recovered.join(", "));
        Ok(recovered)
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> EnvironmentState {
        self.state.lock().await.clone()
    }

    /// Whether the state has ever been saved.
    pub async fn is_persisted(&self) -> bool {
        self.state.lock().await.revision > 0
    }

    /// Removes the environment's state from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses the delete.
    pub async fn delete_environment(&self) -> Result<()> {
        let guard = self.state.lock().await;
        self.store.delete(&guard.environment).await?;
        info!("Removed state of environment '{}'", guard.environment);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalyardError;
    use crate::state::{MemoryStateStore, ResourceRecord, ResourceStatus, StateStore};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn planned(id: &str) -> ResourceRecord {
        ResourceRecord::planned(id, "network.vpc", crate::config::Attributes::new(), "h", BTreeSet::new())
    }

    #[tokio::test]
    async fn test_update_persists_and_bumps_revision() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::default());
        let ledger = StateLedger::open(store.clone(), "dev").await.expect("open");
        assert!(!ledger.is_persisted().await);

        ledger
            .update(|s| {
                s.set_record(planned("vpc"));
                Ok(())
            })
            .await
            .expect("update");

        let stored = store.load("dev").await.expect("load").expect("state");
        assert_eq!(stored.revision, 1);
        assert!(stored.record("vpc").is_some());
        assert!(ledger.is_persisted().await);
    }

    #[tokio::test]
    async fn test_rejected_change_leaves_state_untouched() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::default());
        let ledger = StateLedger::open(store, "dev").await.expect("open");
        ledger
            .update(|s| {
                s.set_record(planned("vpc"));
                Ok(())
            })
            .await
            .expect("update");

        let err = ledger
            .update(|s| s.transition("vpc", ResourceStatus::Deleted))
            .await
            .unwrap_err();
        assert!(matches!(err, HalyardError::State(StateError::InvalidTransition { .. })));

        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.status_of("vpc"), Some(ResourceStatus::Planned));
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflicts() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::default());
        let first = StateLedger::open(store.clone(), "dev").await.expect("open");
        let second = StateLedger::open(store, "dev").await.expect("open");

        first.update(|_| Ok(())).await.expect("first write");
        let err = second.update(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, HalyardError::State(StateError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_recover_marks_interrupted_records_failed() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::default());
        let ledger = StateLedger::open(store, "dev").await.expect("open");
        ledger
            .update(|s| {
                s.set_record(planned("vpc"));
                s.transition("vpc", ResourceStatus::Creating)
            })
            .await
            .expect("update");

        let recovered = ledger.recover().await.expect("recover");
        assert_eq!(recovered, vec!["vpc"]);
        assert_eq!(ledger.snapshot().await.status_of("vpc"), Some(ResourceStatus::Failed));
        assert!(ledger.recover().await.expect("second recover").is_empty());
    }
}
