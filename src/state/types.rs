//! State types for tracking environments and their resources.
//!
//! These types are the durable record of what a run has done: one
//! [`EnvironmentState`] per environment, holding a [`ResourceRecord`] per
//! resource. Records only move along the [`ResourceStatus`] state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::Attributes;
use crate::error::StateError;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of run history entries kept per environment.
const MAX_HISTORY: usize = 100;

/// The complete state of one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentState {
    /// State format version.
    pub version: String,
    /// Environment name.
    pub environment: String,
    /// Monotonic revision, bumped on every successful save.
    pub revision: u64,
    /// Resource records keyed by resource id.
    pub records: BTreeMap<String, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Durable record of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Logical id.
    pub id: String,
    /// Provider resource type.
    pub resource_type: String,
    /// Desired attributes as last applied, references unresolved.
    pub attributes: Attributes,
    /// Hash of `attributes`.
    pub attributes_hash: String,
    /// Attributes reported by the provider after the last create/update.
    #[serde(default)]
    pub outputs: Attributes,
    /// Provider-side identifier, once the resource exists.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Ids of the resources this one depends on.
    #[serde(default)]
    pub dependency_ids: BTreeSet<String>,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Last error recorded against this resource.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Whether the resource was attached with `import` rather than created.
    #[serde(default)]
    pub imported: bool,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Resource lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Known to the desired state, not yet created.
    Planned,
    /// Create in progress.
    Creating,
    /// Exists and matches the last applied attributes.
    Active,
    /// Update in progress.
    Updating,
    /// Delete in progress.
    Deleting,
    /// Deleted.
    Deleted,
    /// The last operation on this resource failed.
    Failed,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunHistoryEntry {
    /// Run identifier.
    pub run_id: String,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Hash of the desired resource set, if one was supplied.
    #[serde(default)]
    pub spec_hash: Option<String>,
    /// Who ran it.
    pub holder: String,
    /// Resources the run acted on.
    pub resources: Vec<String>,
    /// Aggregate outcome as text.
    pub outcome: String,
}

/// Types of runs recorded in the history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Convergence run.
    Apply,
    /// Teardown run.
    Destroy,
    /// Import of an existing resource.
    Import,
}

/// Administrative audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Action name (e.g. `force_release`).
    pub action: String,
    /// Operator that performed it.
    pub actor: String,
    /// Free-form detail.
    pub detail: String,
}

impl ResourceStatus {
    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Planned, Self::Creating)
                | (Self::Creating, Self::Active | Self::Failed)
                | (Self::Active, Self::Updating | Self::Deleting)
                | (Self::Updating, Self::Active | Self::Failed)
                | (Self::Deleting, Self::Deleted | Self::Failed)
                | (Self::Failed, Self::Creating | Self::Updating | Self::Deleting)
                | (Self::Deleted, Self::Planned)
        )
    }

    /// Returns true while an operation is in flight.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }

    /// Returns true if the resource may exist at the provider.
    #[must_use]
    pub const fn may_exist(self) -> bool {
        !matches!(self, Self::Planned | Self::Deleted)
    }
}

impl EnvironmentState {
    /// Creates a new empty environment state.
    #[must_use]
    pub fn new(environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            environment: environment.to_string(),
            revision: 0,
            records: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by id.
    #[must_use]
    pub fn record(&self, id: &str) -> Option<&ResourceRecord> {
        self.records.get(id)
    }

    /// Gets a mutable record by id.
    pub fn record_mut(&mut self, id: &str) -> Option<&mut ResourceRecord> {
        self.records.get_mut(id)
    }

    /// Adds or replaces a record.
    pub fn set_record(&mut self, record: ResourceRecord) {
        self.records.insert(record.id.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record.
    pub fn remove_record(&mut self, id: &str) -> Option<ResourceRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Moves a record to a new status, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or the transition is not allowed.
    pub fn transition(&mut self, id: &str, next: ResourceStatus) -> Result<(), StateError> {
        let record = self.records.get_mut(id).ok_or_else(|| StateError::RecordNotFound {
            resource: id.to_string(),
        })?;
        record.transition(next)?;
        self.last_updated = Utc::now();
        Ok(())
    }

    /// Returns the status of a record, if any.
    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<ResourceStatus> {
        self.records.get(id).map(|r| r.status)
    }

    /// Returns all records with the given status.
    #[must_use]
    pub fn records_with_status(&self, status: ResourceStatus) -> Vec<&ResourceRecord> {
        self.records.values().filter(|r| r.status == status).collect()
    }

    /// Returns true if every record is deleted (or there are none).
    #[must_use]
    pub fn is_fully_deleted(&self) -> bool {
        self.records.values().all(|r| r.status == ResourceStatus::Deleted)
    }

    /// Moves records left mid-operation by a crashed run to `Failed`.
    ///
    /// Returns the ids that were recovered.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let mut recovered = Vec::new();
        for record in self.records.values_mut() {
            if record.status.is_transitional() {
                let previous = record.status;
                record.status = ResourceStatus::Failed;
                record.last_error = Some(format!("interrupted while {previous}"));
                record.updated_at = Utc::now();
                recovered.push(record.id.clone());
            }
        }
        if !recovered.is_empty() {
            self.last_updated = Utc::now();
        }
        recovered
    }

    /// Adds a history entry, keeping only the most recent ones.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl ResourceRecord {
    /// Creates a new planned record.
    #[must_use]
    pub fn planned(
        id: &str,
        resource_type: &str,
        attributes: Attributes,
        attributes_hash: &str,
        dependency_ids: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            attributes,
            attributes_hash: attributes_hash.to_string(),
            outputs: Attributes::new(),
            provider_id: None,
            dependency_ids,
            status: ResourceStatus::Planned,
            last_error: None,
            imported: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates an active record for a resource attached with `import`.
    #[must_use]
    pub fn imported(
        id: &str,
        resource_type: &str,
        provider_id: &str,
        attributes: Attributes,
        attributes_hash: &str,
        outputs: Attributes,
        dependency_ids: BTreeSet<String>,
    ) -> Self {
        let mut record = Self::planned(id, resource_type, attributes, attributes_hash, dependency_ids);
        record.provider_id = Some(provider_id.to_string());
        record.outputs = outputs;
        record.status = ResourceStatus::Active;
        record.imported = true;
        record
    }

    /// Moves the record to a new status, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not allowed.
    pub fn transition(&mut self, next: ResourceStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                resource: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next != ResourceStatus::Failed {
            self.last_error = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the record failed with an error message.
    ///
    /// # Errors
    ///
    /// Returns an error if the current status cannot fail.
    pub fn fail(&mut self, error: &str) -> Result<(), StateError> {
        self.transition(ResourceStatus::Failed)?;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Checks if the resource is active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, ResourceStatus::Active)
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Planned => "planned",
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Import => "import",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ResourceRecord {
        ResourceRecord::planned(id, "network.vpc", Attributes::new(), "h", BTreeSet::new())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut r = record("vpc");
        r.transition(ResourceStatus::Creating).expect("planned -> creating");
        r.transition(ResourceStatus::Active).expect("creating -> active");
        r.transition(ResourceStatus::Updating).expect("active -> updating");
        r.transition(ResourceStatus::Active).expect("updating -> active");
        r.transition(ResourceStatus::Deleting).expect("active -> deleting");
        r.transition(ResourceStatus::Deleted).expect("deleting -> deleted");
        r.transition(ResourceStatus::Planned).expect("deleted -> planned");
    }

    #[test]
    fn test_planned_cannot_skip_to_deleted() {
        let mut r = record("vpc");
        let err = r.transition(ResourceStatus::Deleted).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(r.status, ResourceStatus::Planned);
        assert!(!ResourceStatus::Planned.can_transition_to(ResourceStatus::Deleting));
        assert!(!ResourceStatus::Planned.can_transition_to(ResourceStatus::Active));
    }

    #[test]
    fn test_fail_records_error_and_clears_on_retry() {
        let mut r = record("vpc");
        r.transition(ResourceStatus::Creating).expect("planned -> creating");
        r.fail("quota exceeded").expect("creating -> failed");
        assert_eq!(r.last_error.as_deref(), Some("quota exceeded"));

        r.transition(ResourceStatus::Creating).expect("failed -> creating");
        assert!(r.last_error.is_none());
    }

    #[test]
    fn test_recover_interrupted() {
        let mut state = EnvironmentState::new("dev");
        let mut creating = record("vpc");
        creating.status = ResourceStatus::Creating;
        let mut active = record("subnet");
        active.status = ResourceStatus::Active;
        state.set_record(creating);
        state.set_record(active);

        let recovered = state.recover_interrupted();
        assert_eq!(recovered, vec![String::from("vpc")]);
        assert_eq!(state.status_of("vpc"), Some(ResourceStatus::Failed));
        assert_eq!(state.status_of("subnet"), Some(ResourceStatus::Active));
        assert_eq!(
            state.record("vpc").and_then(|r| r.last_error.clone()).as_deref(),
            Some("interrupted while creating")
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = EnvironmentState::new("dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(RunHistoryEntry {
                run_id: i.to_string(),
                timestamp: Utc::now(),
                operation: RunOperation::Apply,
                spec_hash: None,
                holder: String::from("test"),
                resources: vec![],
                outcome: String::from("success"),
            });
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].run_id, "5");
    }

    #[test]
    fn test_fully_deleted() {
        let mut state = EnvironmentState::new("dev");
        assert!(state.is_fully_deleted());

        let mut r = record("vpc");
        r.status = ResourceStatus::Deleted;
        state.set_record(r);
        assert!(state.is_fully_deleted());

        state.set_record(record("subnet"));
        assert!(!state.is_fully_deleted());
    }
}
