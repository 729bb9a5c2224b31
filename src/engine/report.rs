//! Run reports.
//!
//! A [`RunReport`] is the ephemeral result of one apply, destroy or import.
//! It is never written to the state store; only a short
//! [`RunHistoryEntry`] derived from it is.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::state::{ResourceStatus, RunHistoryEntry, RunOperation};

/// Action taken on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Nothing to do.
    NoOp,
    /// Delete a resource.
    Delete,
    /// Attach an existing resource.
    Import,
    /// Hand credential material to the sink.
    PublishCredentials,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::NoOp => "no-op",
            Self::Delete => "delete",
            Self::Import => "import",
            Self::PublishCredentials => "publish-credentials",
        };
        write!(f, "{action}")
    }
}

/// Outcome of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    /// The action completed.
    Succeeded,
    /// The action was attempted and failed.
    Failed,
    /// The action could not start because a neighbour failed.
    Blocked,
    /// The action was not started (fail-fast or cancellation).
    Skipped,
}

impl std::fmt::Display for EntryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
        };
        write!(f, "{outcome}")
    }
}

/// One line of a run report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    /// Logical resource id.
    pub resource_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Action taken or intended.
    pub action: Action,
    /// How it ended.
    pub outcome: EntryOutcome,
    /// Record status after the action, if a record exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResourceStatus>,
    /// Error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider calls made, retries included.
    pub attempts: u32,
    /// Sequence number at dispatch (0 if never dispatched).
    pub dispatched_seq: u64,
    /// Sequence number at completion.
    pub completed_seq: u64,
    /// When work started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the entry was recorded.
    pub finished_at: DateTime<Utc>,
}

impl ReportEntry {
    /// Creates an entry that was never dispatched.
    #[must_use]
    pub fn new(resource_id: &str, resource_type: &str, action: Action, outcome: EntryOutcome) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            resource_type: resource_type.to_string(),
            action,
            outcome,
            status: None,
            error: None,
            attempts: 0,
            dispatched_seq: 0,
            completed_seq: 0,
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    /// Sets the resulting record status.
    #[must_use]
    pub const fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the number of provider calls.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Marks when the entry was dispatched.
    #[must_use]
    pub const fn dispatched(mut self, seq: u64, at: DateTime<Utc>) -> Self {
        self.dispatched_seq = seq;
        self.started_at = Some(at);
        self
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every action succeeded.
    Success,
    /// Apply stopped on an error.
    Failed,
    /// Some resources were left failed, blocked, or untouched.
    PartialFailure,
}

impl RunOutcome {
    /// Process exit code.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success => EXIT_SUCCESS,
            Self::Failed | Self::PartialFailure => EXIT_FAILURE,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::PartialFailure => "partial_failure",
        };
        write!(f, "{outcome}")
    }
}

/// Counts per action and outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    /// Successful creates.
    pub created: usize,
    /// Successful updates.
    pub updated: usize,
    /// No-op entries.
    pub unchanged: usize,
    /// Successful deletes.
    pub deleted: usize,
    /// Successful imports.
    pub imported: usize,
    /// Failed entries.
    pub failed: usize,
    /// Blocked entries.
    pub blocked: usize,
    /// Skipped entries.
    pub skipped: usize,
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// Environment scope.
    pub environment: String,
    /// What kind of run this was.
    pub operation: RunOperation,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Aggregate outcome.
    pub outcome: RunOutcome,
    /// Cancellation reason, if the run was cut short.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<String>,
    /// Run-level error, if the run was rejected before doing anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Entries in completion order.
    pub entries: Vec<ReportEntry>,
}

impl RunReport {
    /// A report for a run that was rejected before touching any resource.
    #[must_use]
    pub fn rejected(environment: &str, operation: RunOperation, error: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            environment: environment.to_string(),
            operation,
            started_at: now,
            finished_at: now,
            outcome: RunOutcome::Failed,
            cancelled: None,
            error: Some(error.to_string()),
            entries: Vec::new(),
        }
    }

    /// The resource entry (not the credential entry) for an id.
    #[must_use]
    pub fn entry(&self, resource_id: &str) -> Option<&ReportEntry> {
        self.entries
            .iter()
            .find(|e| e.resource_id == resource_id && e.action != Action::PublishCredentials)
    }

    /// Resource ids of entries with the given action, in completion order.
    #[must_use]
    pub fn ids_with_action(&self, action: Action) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.action == action)
            .map(|e| e.resource_id.as_str())
            .collect()
    }

    /// Counts per action and outcome.
    #[must_use]
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for entry in &self.entries {
            match (entry.outcome, entry.action) {
                (EntryOutcome::Succeeded, Action::Create) => summary.created += 1,
                (EntryOutcome::Succeeded, Action::Update) => summary.updated += 1,
                (EntryOutcome::Succeeded, Action::NoOp) => summary.unchanged += 1,
                (EntryOutcome::Succeeded, Action::Delete) => summary.deleted += 1,
                (EntryOutcome::Succeeded, Action::Import) => summary.imported += 1,
                (EntryOutcome::Succeeded, Action::PublishCredentials) => {}
                (EntryOutcome::Failed, _) => summary.failed += 1,
                (EntryOutcome::Blocked, _) => summary.blocked += 1,
                (EntryOutcome::Skipped, _) => summary.skipped += 1,
            }
        }
        summary
    }

    /// Returns true if every action was a no-op.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.entries.iter().all(|e| e.action == Action::NoOp)
    }

    /// Process exit code.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }

    /// The history line recorded in the environment state.
    #[must_use]
    pub fn history_entry(&self, holder: &str, spec_hash: Option<String>) -> RunHistoryEntry {
        RunHistoryEntry {
            run_id: self.run_id.clone(),
            timestamp: self.finished_at,
            operation: self.operation,
            spec_hash,
            holder: holder.to_string(),
            resources: self
                .entries
                .iter()
                .filter(|e| e.action != Action::NoOp && e.outcome != EntryOutcome::Skipped)
                .map(|e| e.resource_id.clone())
                .collect(),
            outcome: self.outcome.to_string(),
        }
    }
}

/// Collects entries from concurrent workers.
///
/// A single counter hands out dispatch and completion sequence numbers so
/// the ordering of a run can be checked after the fact.
#[derive(Debug)]
pub struct ReportRecorder {
    run_id: String,
    environment: String,
    operation: RunOperation,
    started_at: DateTime<Utc>,
    seq: AtomicU64,
    entries: Mutex<Vec<ReportEntry>>,
}

impl ReportRecorder {
    /// Starts recording a run.
    #[must_use]
    pub fn new(run_id: &str, environment: &str, operation: RunOperation) -> Self {
        Self {
            run_id: run_id.to_string(),
            environment: environment.to_string(),
            operation,
            started_at: Utc::now(),
            seq: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Takes the next sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records a finished entry, stamping its completion sequence.
    pub fn record(&self, mut entry: ReportEntry) {
        entry.completed_seq = self.next_seq();
        entry.finished_at = Utc::now();
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }

    /// Whether any recorded entry has the given outcome.
    pub fn any(&self, outcome: EntryOutcome) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.outcome == outcome)
    }

    /// Closes the report.
    #[must_use]
    pub fn finish(self, outcome: RunOutcome, cancelled: Option<String>) -> RunReport {
        let mut entries = self.entries.into_inner().unwrap_or_else(PoisonError::into_inner);
        entries.sort_by_key(|e| e.completed_seq);
        RunReport {
            run_id: self.run_id,
            environment: self.environment,
            operation: self.operation,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            cancelled,
            error: None,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_orders_by_completion() {
        let recorder = ReportRecorder::new("run-1", "dev", RunOperation::Apply);
        let first = recorder.next_seq();
        let second = recorder.next_seq();

        recorder.record(
            ReportEntry::new("subnet", "network.subnet", Action::Create, EntryOutcome::Succeeded)
                .dispatched(second, Utc::now()),
        );
        recorder.record(
            ReportEntry::new("vpc", "network.vpc", Action::Create, EntryOutcome::Succeeded).dispatched(first, Utc::now()),
        );
        assert!(!recorder.any(EntryOutcome::Failed));

        let report = recorder.finish(RunOutcome::Success, None);
        assert_eq!(report.ids_with_action(Action::Create), vec!["subnet", "vpc"]);
        let vpc = report.entry("vpc").expect("vpc entry");
        assert!(vpc.dispatched_seq < vpc.completed_seq);
        assert_eq!(report.summary().created, 2);
    }

    #[test]
    fn test_summary_and_exit_code() {
        let recorder = ReportRecorder::new("run-2", "dev", RunOperation::Destroy);
        recorder.record(ReportEntry::new("t", "lb.target", Action::Delete, EntryOutcome::Succeeded));
        recorder.record(
            ReportEntry::new("l", "lb", Action::Delete, EntryOutcome::Failed)
                .with_status(ResourceStatus::Failed)
                .with_error("stuck"),
        );
        recorder.record(ReportEntry::new("s", "subnet", Action::Delete, EntryOutcome::Blocked));

        let report = recorder.finish(RunOutcome::PartialFailure, None);
        let summary = report.summary();
        assert_eq!((summary.deleted, summary.failed, summary.blocked), (1, 1, 1));
        assert_eq!(report.exit_code(), EXIT_FAILURE);

        let history = report.history_entry("ci", None);
        assert_eq!(history.resources, vec!["t", "l", "s"]);
        assert_eq!(history.outcome, "partial_failure");
    }

    #[test]
    fn test_action_serializes_kebab_case() {
        let json = serde_json::to_string(&Action::PublishCredentials).expect("serialize");
        assert_eq!(json, "\"publish-credentials\"");
        assert_eq!(Action::NoOp.to_string(), "no-op");
    }
}
