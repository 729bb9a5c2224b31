//! Lease-based mutual exclusion over environment scopes.
//!
//! The manager never keeps lock state of its own. Every decision is a
//! conditional write against the [`StateStore`](crate::state::StateStore),
//! so two managers in different processes arbitrate through the same
//! primitive.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::engine::{BackoffPolicy, CancelSignal};
use crate::error::{HalyardError, LockError, Result, StateError};
use crate::state::{AuditEntry, SharedStateStore};

use super::lease::{LeaseCondition, LockLease};

/// Audit action recorded by [`LockManager::force_release`].
pub const FORCE_RELEASE_ACTION: &str = "force_release";

/// Lock manager over a shared state store.
#[derive(Clone)]
pub struct LockManager {
    store: SharedStateStore,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.store.backend_type())
            .finish()
    }
}

impl LockManager {
    /// Creates a lock manager.
    #[must_use]
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    /// Acquires the lease on `scope`.
    ///
    /// Succeeds if no lease exists or the stored one is stale. Under
    /// concurrent attempts exactly one caller wins.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] if a live lease exists or another caller
    /// won the race.
    pub async fn acquire(&self, scope: &str, holder_id: &str, ttl: Duration) -> Result<LockLease> {
        let lease = LockLease::new(scope, holder_id, ttl);

        let condition = match self.store.read_lease(scope).await? {
            Some(existing) if !existing.is_stale() => return Err(held(&existing)),
            Some(stale) => {
                warn!(
                    "Reclaiming stale lease on '{scope}' held by {} (last heartbeat {})",
                    stale.holder_id, stale.heartbeat_at
                );
                stale.exact_condition()
            }
            None => LeaseCondition::Absent,
        };

        match self.store.write_lease(&lease, &condition).await {
            Ok(()) => {
                info!(
                    "Acquired lock on '{scope}' for {holder_id} (lease {}, ttl {}s)",
                    lease.lease_id, lease.ttl_secs
                );
                Ok(lease)
            }
            Err(HalyardError::State(StateError::Conflict { .. })) => {
                debug!("Lost lock race on '{scope}'");
                let winner = self.store.read_lease(scope).await?;
                Err(winner.as_ref().map_or_else(
                    || {
                        LockError::Held {
                            scope: scope.to_string(),
                            holder: String::from("unknown"),
                            since: String::new(),
                            heartbeat_at: String::new(),
                        }
                        .into()
                    },
                    held,
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Acquires the lease, retrying with backoff while it is held.
    ///
    /// With `wait` set to `None` this is [`acquire`](Self::acquire).
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] once the wait budget is spent.
    pub async fn acquire_with_wait(
        &self,
        scope: &str,
        holder_id: &str,
        ttl: Duration,
        wait: Option<Duration>,
        policy: &BackoffPolicy,
    ) -> Result<LockLease> {
        let Some(wait) = wait else {
            return self.acquire(scope, holder_id, ttl).await;
        };

        let deadline = Instant::now() + wait;
        let mut attempt = 0;
        loop {
            match self.acquire(scope, holder_id, ttl).await {
                Err(e) if e.is_lock_contention() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(e);
                    }
                    let delay = policy.delay_for(attempt).min(remaining);
                    info!("Lock on '{scope}' is held; retrying in {}ms", delay.as_millis());
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Extends the lease's heartbeat and returns the refreshed lease.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LeaseLost`] if the stored lease is no longer
    /// exactly this one (released, force-released, or reclaimed).
    pub async fn heartbeat(&self, lease: &LockLease) -> Result<LockLease> {
        let next = lease.refreshed();
        match self.store.write_lease(&next, &lease.exact_condition()).await {
            Ok(()) => {
                debug!("Heartbeat on '{}' (revision {})", lease.scope, next.revision);
                Ok(next)
            }
            Err(HalyardError::State(StateError::Conflict { .. })) => Err(LockError::LeaseLost {
                scope: lease.scope.clone(),
                lease_id: lease.lease_id.clone(),
            }
            .into()),
            Err(e) => Err(e),
        }
    }

    /// Releases the lease if the caller still holds it; no-op otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub async fn release(&self, lease: &LockLease) -> Result<bool> {
        let condition = LeaseCondition::Holder {
            lease_id: lease.lease_id.clone(),
        };
        let released = self.store.delete_lease(&lease.scope, &condition).await?;
        if released {
            info!("Released lock on '{}' (lease {})", lease.scope, lease.lease_id);
        } else {
            debug!("Lease {} on '{}' no longer held; nothing to release", lease.lease_id, lease.scope);
        }
        Ok(released)
    }

    /// Deletes any lease on `scope` regardless of staleness and records the
    /// action in the audit log.
    ///
    /// Returns the lease that was removed, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub async fn force_release(&self, scope: &str, actor: &str, reason: &str) -> Result<Option<LockLease>> {
        let previous = self.store.read_lease(scope).await?;
        let removed = self.store.delete_lease(scope, &LeaseCondition::Any).await?;

        let detail = match (&previous, removed) {
            (Some(lease), true) => format!(
                "removed lease {} held by {} since {}; reason: {reason}",
                lease.lease_id, lease.holder_id, lease.acquired_at
            ),
            _ => format!("no lease present; reason: {reason}"),
        };

        self.store
            .append_audit(
                scope,
                &AuditEntry {
                    timestamp: Utc::now(),
                    action: FORCE_RELEASE_ACTION.to_string(),
                    actor: actor.to_string(),
                    detail: detail.clone(),
                },
            )
            .await?;

        warn!("Force-released lock on '{scope}' by {actor}: {detail}");
        Ok(if removed { previous } else { None })
    }

    /// Reads the current lease of a scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub async fn current(&self, scope: &str) -> Result<Option<LockLease>> {
        self.store.read_lease(scope).await
    }

    /// Starts a background task that heartbeats `lease` every `interval`.
    ///
    /// If the lease is lost the task fires `cancel` and exits.
    #[must_use]
    pub fn spawn_heartbeat(&self, lease: LockLease, interval: Duration, cancel: CancelSignal) -> HeartbeatHandle {
        let manager = self.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut current = lease;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    () = sleep(interval) => {
                        match manager.heartbeat(&current).await {
                            Ok(next) => current = next,
                            Err(HalyardError::Lock(LockError::LeaseLost { .. })) => {
                                error!("Lost lease on '{}'; cancelling run", current.scope);
                                cancel.cancel("lock lease lost");
                                break;
                            }
                            Err(e) => warn!("Heartbeat on '{}' failed: {e}", current.scope),
                        }
                    }
                }
            }
            current
        });

        HeartbeatHandle { stop: stop_tx, task }
    }
}

fn held(lease: &LockLease) -> HalyardError {
    LockError::Held {
        scope: lease.scope.clone(),
        holder: lease.holder_id.clone(),
        since: lease.acquired_at.to_rfc3339(),
        heartbeat_at: lease.heartbeat_at.to_rfc3339(),
    }
    .into()
}

/// Handle to a running heartbeat task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<LockLease>,
}

impl HeartbeatHandle {
    /// Stops heartbeating and returns the latest lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the task panicked.
    pub async fn stop(self) -> Result<LockLease> {
        // The task may already have exited after losing the lease.
        let _ = self.stop.send(());
        self.task
            .await
            .map_err(|e| HalyardError::internal(format!("heartbeat task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{LocalStateStore, MemoryStateStore, StateStore};
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn manager() -> (LockManager, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        (LockManager::new(store.clone()), store)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_concurrent_acquire_is_exclusive() {
        let (manager, _store) = manager();

        let (a, b) = tokio::join!(manager.acquire("prod", "h1", TTL), manager.acquire("prod", "h2", TTL));

        assert!(a.is_ok() ^ b.is_ok(), "exactly one acquire must win");
        let loser = if a.is_ok() { b } else { a };
        assert!(loser.unwrap_err().is_lock_contention());
    }

    #[tokio::test]
    async fn test_many_concurrent_acquires_have_one_winner() {
        let (manager, _store) = manager();

        let attempts = (0..8).map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("prod", &format!("h{i}"), TTL).await })
        });
        let results = futures_util::future::join_all(attempts).await;

        let winners = results
            .into_iter()
            .map(|r| r.expect("task"))
            .filter(Result::is_ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_store_concurrent_acquires_report_contention() {
        let temp = tempfile::TempDir::new().expect("temp dir");

        for round in 0..50 {
            // One store per contender, as if each ran in its own process.
            let attempts = (0..4).map(|i| {
                let manager = LockManager::new(Arc::new(LocalStateStore::with_base_dir(temp.path())));
                tokio::spawn(async move { manager.acquire("prod", &format!("r{round}-h{i}"), TTL).await })
            });
            let results = futures_util::future::join_all(attempts).await;

            let mut winners = Vec::new();
            for result in results.into_iter().map(|r| r.expect("task")) {
                match result {
                    Ok(lease) => winners.push(lease),
                    Err(e) => assert!(e.is_lock_contention(), "round {round}: unexpected error {e}"),
                }
            }
            assert_eq!(winners.len(), 1, "round {round}");

            let manager = LockManager::new(Arc::new(LocalStateStore::with_base_dir(temp.path())));
            assert!(manager.release(&winners[0]).await.expect("release"));
        }
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimable() {
        let (manager, store) = manager();

        let mut old = assert_ok!(manager.acquire("prod", "crashed", TTL).await);
        assert_err!(manager.acquire("prod", "fresh", TTL).await);

        old.heartbeat_at = Utc::now() - ChronoDuration::seconds(61);
        store.write_lease(&old, &LeaseCondition::Any).await.expect("age lease");

        let lease = assert_ok!(manager.acquire("prod", "fresh", TTL).await);
        assert_eq!(lease.holder_id, "fresh");
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let (manager, _store) = manager();

        let lease = manager.acquire("prod", "h1", TTL).await.expect("acquire");
        let impostor = LockLease::new("prod", "h2", TTL);

        assert!(!manager.release(&impostor).await.expect("release"));
        assert!(manager.current("prod").await.expect("read").is_some());

        assert!(manager.release(&lease).await.expect("release"));
        assert!(manager.current("prod").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_after_force_release_reports_loss() {
        let (manager, store) = manager();

        let lease = manager.acquire("prod", "h1", TTL).await.expect("acquire");
        let lease = manager.heartbeat(&lease).await.expect("heartbeat");
        assert_eq!(lease.revision, 2);

        let removed = manager
            .force_release("prod", "ops", "stuck pipeline")
            .await
            .expect("force release");
        assert_eq!(removed.map(|l| l.holder_id), Some(String::from("h1")));

        let err = assert_err!(manager.heartbeat(&lease).await);
        assert!(matches!(err, HalyardError::Lock(LockError::LeaseLost { .. })));

        let audit = store.list_audit("prod").await.expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, FORCE_RELEASE_ACTION);
        assert!(audit[0].detail.contains("stuck pipeline"));
    }

    #[tokio::test]
    async fn test_wait_gives_up_after_budget() {
        let (manager, _store) = manager();
        let _held = manager.acquire("prod", "h1", TTL).await.expect("acquire");

        let policy = BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(10), 2.0);
        let err = assert_err!(
            manager
                .acquire_with_wait("prod", "h2", TTL, Some(Duration::from_millis(30)), &policy)
                .await
        );
        assert!(err.is_lock_contention());
    }

    #[tokio::test]
    async fn test_wait_succeeds_once_released() {
        let (manager, _store) = manager();
        let held = manager.acquire("prod", "h1", TTL).await.expect("acquire");

        let releaser = manager.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            releaser.release(&held).await.expect("release");
        });

        let policy = BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(10), 2.0);
        let lease = manager
            .acquire_with_wait("prod", "h2", TTL, Some(Duration::from_secs(5)), &policy)
            .await
            .expect("acquired after release");
        assert_eq!(lease.holder_id, "h2");
    }

    #[tokio::test]
    async fn test_heartbeat_task_cancels_on_loss() {
        let (manager, _store) = manager();
        let lease = manager.acquire("prod", "h1", TTL).await.expect("acquire");

        let cancel = CancelSignal::new();
        let handle = manager.spawn_heartbeat(lease, Duration::from_millis(10), cancel.clone());

        manager.force_release("prod", "ops", "test").await.expect("force release");
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("cancel fired");
        assert_eq!(cancel.reason().as_deref(), Some("lock lease lost"));

        handle.stop().await.expect("stop");
    }
}
