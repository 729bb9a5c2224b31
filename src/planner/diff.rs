//! Diff engine for comparing desired resources with recorded state.
//!
//! The diff is computed against the state store only; the provider is never
//! queried here. Live divergence is the drift detector's business.

use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::config::{ConfigHasher, ResourceSpec};
use crate::error::{ConfigError, Result};
use crate::graph::GraphBuilder;
use crate::state::{EnvironmentState, ResourceRecord, ResourceStatus};

/// Engine for computing diffs between desired and recorded states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource id.
    pub id: String,
    /// Resource type.
    pub resource_type: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Why the resource needs this action.
    pub reason: String,
    /// Field-level differences.
    pub details: Vec<DiffDetail>,
    /// Recorded status, if any.
    pub current_status: Option<ResourceStatus>,
    /// Recorded hash (if applicable).
    pub old_hash: Option<String>,
    /// Desired hash (if applicable).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated in place.
    Update,
    /// Resource is unchanged.
    NoChange,
    /// Resource is recorded but no longer desired. Apply leaves it alone.
    Orphaned,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<String>,
    /// Desired value.
    pub new_value: Option<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// All resource diffs: desired resources in declaration order, then orphans.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
    /// Number of orphaned records.
    pub orphaned: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the desired resources and the recorded state.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a desired resource changes the type of
    /// an existing record; that requires an explicit destroy first.
    pub fn compute_diff(&self, specs: &[ResourceSpec], state: Option<&EnvironmentState>) -> Result<DiffResult> {
        let mut diffs = Vec::with_capacity(specs.len());

        for spec in specs {
            let new_hash = self.hasher.hash_resource(spec);
            let record = state.and_then(|s| s.record(&spec.id));

            if let Some(record) = record {
                if record.status.may_exist() && record.resource_type != spec.resource_type {
                    return Err(ConfigError::validation(
                        format!(
                            "resource '{}' changes type from {} to {}; destroy it first",
                            spec.id, record.resource_type, spec.resource_type
                        ),
                        format!("resources.{}.type", spec.id),
                    )
                    .into());
                }
            }

            let diff = Self::compute_resource_diff(spec, record, &new_hash);
            debug!("{}: {} ({})", diff.id, diff.diff_type, diff.reason);
            diffs.push(diff);
        }

        if let Some(state) = state {
            let desired: HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();
            for record in state.records.values() {
                if desired.contains(record.id.as_str()) || record.status == ResourceStatus::Deleted {
                    continue;
                }
                debug!("Found orphaned record: {}", record.id);
                diffs.push(ResourceDiff {
                    id: record.id.clone(),
                    resource_type: record.resource_type.clone(),
                    diff_type: DiffType::Orphaned,
                    reason: String::from("recorded but no longer declared; removed only by destroy"),
                    details: Vec::new(),
                    current_status: Some(record.status),
                    old_hash: Some(record.attributes_hash.clone()),
                    new_hash: None,
                });
            }
        }

        let count = |kind: DiffType| diffs.iter().filter(|d| d.diff_type == kind).count();
        Ok(DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            unchanged: count(DiffType::NoChange),
            orphaned: count(DiffType::Orphaned),
            diffs,
        })
    }

    fn compute_resource_diff(spec: &ResourceSpec, record: Option<&ResourceRecord>, new_hash: &str) -> ResourceDiff {
        let (diff_type, reason) = match record {
            None => (DiffType::Create, String::from("not recorded")),
            Some(r) => match (r.status, r.provider_id.is_some()) {
                (ResourceStatus::Planned, _) => (DiffType::Create, String::from("planned, never created")),
                (ResourceStatus::Deleted, _) => (DiffType::Create, String::from("previously deleted")),
                (ResourceStatus::Active, _) if r.attributes_hash == new_hash => {
                    (DiffType::NoChange, String::from("up to date"))
                }
                (ResourceStatus::Active, _) => (DiffType::Update, String::from("desired attributes changed")),
                (status, false) => (DiffType::Create, format!("{status} without a provider id")),
                (status, true) => (DiffType::Update, format!("{status}; converging existing resource")),
            },
        };

        let details = match (diff_type, record) {
            (DiffType::Update, Some(r)) => Self::compute_detailed_diff(spec, r),
            (DiffType::Create, _) => vec![DiffDetail {
                field: String::from("resource"),
                old_value: None,
                new_value: Some(spec.resource_type.clone()),
            }],
            _ => Vec::new(),
        };

        ResourceDiff {
            id: spec.id.clone(),
            resource_type: spec.resource_type.clone(),
            diff_type,
            reason,
            details,
            current_status: record.map(|r| r.status),
            old_hash: record.map(|r| r.attributes_hash.clone()),
            new_hash: Some(new_hash.to_string()),
        }
    }

    /// Field-level differences between a record and its desired spec.
    fn compute_detailed_diff(spec: &ResourceSpec, record: &ResourceRecord) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        let keys: BTreeSet<&String> = record.attributes.keys().chain(spec.attributes.keys()).collect();
        for key in keys {
            let old = record.attributes.get(key);
            let new = spec.attributes.get(key);
            if old != new {
                details.push(DiffDetail {
                    field: key.clone(),
                    old_value: old.map(ToString::to_string),
                    new_value: new.map(ToString::to_string),
                });
            }
        }

        let desired_deps = GraphBuilder::spec_dependencies(spec);
        if desired_deps != record.dependency_ids {
            let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
            details.push(DiffDetail {
                field: String::from("depends_on"),
                old_value: Some(join(&record.dependency_ids)),
                new_value: Some(join(&desired_deps)),
            });
        }

        details
    }
}

impl DiffResult {
    /// Returns true if apply would do anything.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates
    }

    /// Gets the diff of a resource.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.id == id)
    }

    /// Orphaned records.
    #[must_use]
    pub fn orphans(&self) -> Vec<&ResourceDiff> {
        self.diffs.iter().filter(|d| d.diff_type == DiffType::Orphaned).collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::NoChange => "no change",
            Self::Orphaned => "orphaned",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.diff_type)?;
        if !self.details.is_empty() {
            let fields: Vec<&str> = self.details.iter().map(|d| d.field.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HalyardError;
    use serde_json::json;

    fn vpc() -> ResourceSpec {
        ResourceSpec::new("vpc", "network.vpc").with_attribute("cidr", "10.0.0.0/16")
    }

    fn active_record(spec: &ResourceSpec) -> ResourceRecord {
        let mut record = ResourceRecord::planned(
            &spec.id,
            &spec.resource_type,
            spec.attributes.clone(),
            &ConfigHasher::new().hash_resource(spec),
            GraphBuilder::spec_dependencies(spec),
        );
        record.provider_id = Some(String::from("vpc-1"));
        record.status = ResourceStatus::Active;
        record
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let specs = vec![vpc(), ResourceSpec::new("subnet", "network.subnet").depends_on("vpc")];
        let diff = DiffEngine::new().compute_diff(&specs, None).expect("diff");
        assert_eq!(diff.creates, 2);
        assert!(diff.has_changes());
    }

    #[test]
    fn test_matching_record_is_no_change() {
        let spec = vpc();
        let mut state = EnvironmentState::new("dev");
        state.set_record(active_record(&spec));

        let diff = DiffEngine::new().compute_diff(&[spec], Some(&state)).expect("diff");
        assert_eq!(diff.unchanged, 1);
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_changed_attribute_is_update_with_detail() {
        let spec = vpc();
        let mut state = EnvironmentState::new("dev");
        state.set_record(active_record(&spec));

        let changed = spec.with_attribute("cidr", "10.1.0.0/16");
        let diff = DiffEngine::new().compute_diff(&[changed], Some(&state)).expect("diff");
        let entry = diff.get("vpc").expect("vpc diff");
        assert_eq!(entry.diff_type, DiffType::Update);
        assert_eq!(entry.details[0].field, "cidr");
        assert_eq!(entry.details[0].new_value.as_deref(), Some(json!("10.1.0.0/16").to_string().as_str()));
    }

    #[test]
    fn test_failed_records_follow_provider_id() {
        let spec = vpc();
        let mut state = EnvironmentState::new("dev");
        let mut record = active_record(&spec);
        record.status = ResourceStatus::Failed;
        state.set_record(record.clone());

        let diff = DiffEngine::new().compute_diff(std::slice::from_ref(&spec), Some(&state)).expect("diff");
        assert_eq!(diff.get("vpc").map(|d| d.diff_type), Some(DiffType::Update));

        record.provider_id = None;
        state.set_record(record);
        let diff = DiffEngine::new().compute_diff(&[spec], Some(&state)).expect("diff");
        assert_eq!(diff.get("vpc").map(|d| d.diff_type), Some(DiffType::Create));
    }

    #[test]
    fn test_orphans_and_type_change() {
        let spec = vpc();
        let mut state = EnvironmentState::new("dev");
        state.set_record(active_record(&spec));

        let diff = DiffEngine::new().compute_diff(&[], Some(&state)).expect("diff");
        assert_eq!(diff.orphaned, 1);
        assert!(!diff.has_changes());

        let retyped = ResourceSpec::new("vpc", "network.vnet");
        let err = DiffEngine::new().compute_diff(&[retyped], Some(&state)).unwrap_err();
        assert!(matches!(err, HalyardError::Config(ConfigError::ValidationError { .. })));
        assert!(err.is_invalid_spec());
    }
}
