//! Lease records for environment locks.
//!
//! A lease is a time-bounded exclusive claim on an environment scope. It
//! stays live while its holder heartbeats; once `now > heartbeat_at + ttl`
//! anyone may reclaim it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A lock lease over an environment scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockLease {
    /// Locked scope (environment name).
    pub scope: String,
    /// Who holds the lease.
    pub holder_id: String,
    /// Unique lease identifier.
    pub lease_id: String,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Time-to-live in seconds, measured from the last heartbeat.
    pub ttl_secs: u64,
    /// Last heartbeat.
    pub heartbeat_at: DateTime<Utc>,
    /// Write counter, bumped on every heartbeat; used as a fencing token.
    pub revision: u64,
}

/// Condition attached to a lease write or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseCondition {
    /// Succeeds only if no lease is stored.
    Absent,
    /// Succeeds only if the stored lease has this id and revision.
    Revision {
        /// Expected lease id.
        lease_id: String,
        /// Expected revision.
        revision: u64,
    },
    /// Succeeds only if the stored lease has this id.
    Holder {
        /// Expected lease id.
        lease_id: String,
    },
    /// Always succeeds.
    Any,
}

impl LockLease {
    /// Creates a new lease for a holder.
    #[must_use]
    pub fn new(scope: &str, holder_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            scope: scope.to_string(),
            holder_id: holder_id.to_string(),
            lease_id: Uuid::new_v4().to_string(),
            acquired_at: now,
            ttl_secs: ttl.as_secs(),
            heartbeat_at: now,
            revision: 1,
        }
    }

    /// When the lease becomes stale without another heartbeat.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        self.heartbeat_at + ChronoDuration::seconds(ttl)
    }

    /// Checks if the lease is stale at the given instant.
    #[must_use]
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Checks if the lease is stale now.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    /// Returns a copy with a fresh heartbeat and the next revision.
    #[must_use]
    pub fn refreshed(&self) -> Self {
        let mut next = self.clone();
        next.heartbeat_at = Utc::now();
        next.revision = self.revision.saturating_add(1);
        next
    }

    /// Returns the remaining time until staleness in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at() - Utc::now()).num_seconds().max(0)
    }

    /// Condition matching exactly this lease revision.
    #[must_use]
    pub fn exact_condition(&self) -> LeaseCondition {
        LeaseCondition::Revision {
            lease_id: self.lease_id.clone(),
            revision: self.revision,
        }
    }
}

impl LeaseCondition {
    /// Evaluates the condition against the currently stored lease.
    #[must_use]
    pub fn matches(&self, current: Option<&LockLease>) -> bool {
        match (self, current) {
            (Self::Any, _) | (Self::Absent, None) => true,
            (Self::Revision { lease_id, revision }, Some(lease)) => {
                lease.lease_id == *lease_id && lease.revision == *revision
            }
            (Self::Holder { lease_id }, Some(lease)) => lease.lease_id == *lease_id,
            _ => false,
        }
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}
