//! Drift detection.
//!
//! Read-only: live attributes of every `Active` record are compared with
//! what was recorded at its last convergence. Nothing is written, and a
//! drifted record keeps its status until an explicit apply.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Attributes;
use crate::error::ErrorClass;
use crate::provider::Provider;
use crate::state::{EnvironmentState, ResourceRecord};

use super::context::EngineSettings;
use super::poll::retry_transient;

/// How a record compares with the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Live attributes match.
    InSync,
    /// Some attributes differ.
    Changed,
    /// The provider no longer has the resource.
    Missing,
    /// The provider could not be queried.
    Unreadable,
}

/// One differing attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeDrift {
    /// Attribute name.
    pub field: String,
    /// Recorded value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded: Option<Value>,
    /// Live value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<Value>,
}

/// Drift of one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDrift {
    /// Resource id.
    pub id: String,
    /// Resource type.
    pub resource_type: String,
    /// Provider id.
    pub provider_id: String,
    /// Comparison result.
    pub kind: DriftKind,
    /// Differing attributes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeDrift>,
    /// Read error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drift of a whole environment.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Environment scope.
    pub environment: String,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
    /// Per-resource results, in record order.
    pub resources: Vec<ResourceDrift>,
}

impl DriftReport {
    /// Returns true if any resource drifted or went missing.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.resources
            .iter()
            .any(|r| matches!(r.kind, DriftKind::Changed | DriftKind::Missing))
    }

    /// Resources that are not in sync.
    #[must_use]
    pub fn drifted(&self) -> Vec<&ResourceDrift> {
        self.resources.iter().filter(|r| r.kind != DriftKind::InSync).collect()
    }

    /// Drift of one resource.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceDrift> {
        self.resources.iter().find(|r| r.id == id)
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let drifted = self.drifted();
        if drifted.is_empty() {
            return write!(f, "No drift detected in '{}'", self.environment);
        }
        writeln!(f, "Drift detected in '{}':", self.environment)?;
        for resource in drifted {
            let fields: Vec<&str> = resource.changes.iter().map(|c| c.field.as_str()).collect();
            writeln!(f, "  - {} ({:?}) {}", resource.id, resource.kind, fields.join(", "))?;
        }
        Ok(())
    }
}

/// Compares recorded state with live provider state.
pub struct DriftDetector<'a> {
    provider: &'a dyn Provider,
    settings: &'a EngineSettings,
}

impl<'a> DriftDetector<'a> {
    /// Creates a detector.
    #[must_use]
    pub const fn new(provider: &'a dyn Provider, settings: &'a EngineSettings) -> Self {
        Self { provider, settings }
    }

    /// Checks every `Active` record of `state`.
    pub async fn detect(&self, state: &EnvironmentState) -> DriftReport {
        let active: Vec<&ResourceRecord> = state.records.values().filter(|r| r.is_active()).collect();
        info!("Checking {} active resource(s) in '{}' for drift", active.len(), state.environment);

        let mut resources: Vec<ResourceDrift> = stream::iter(active)
            .filter_map(|record| async move { self.check(record).await })
            .collect::<Vec<_>>()
            .await;
        resources.sort_by(|a, b| a.id.cmp(&b.id));

        let report = DriftReport {
            environment: state.environment.clone(),
            checked_at: Utc::now(),
            resources,
        };
        if report.has_drift() {
            warn!("{} resource(s) drifted", report.drifted().len());
        }
        report
    }

    async fn check(&self, record: &ResourceRecord) -> Option<ResourceDrift> {
        let provider_id = record.provider_id.as_deref()?;
        let provider = self.provider;
        let resource_type = record.resource_type.as_str();
        let deadline = Instant::now() + self.settings.resource_timeout;

        let read = retry_transient(
            "read",
            &self.settings.retry,
            self.settings.call_timeout,
            deadline,
            move || provider.read(resource_type, provider_id),
        )
        .await;

        let mut drift = ResourceDrift {
            id: record.id.clone(),
            resource_type: record.resource_type.clone(),
            provider_id: provider_id.to_string(),
            kind: DriftKind::InSync,
            changes: Vec::new(),
            error: None,
        };

        match read.result {
            Ok(live) => {
                let recorded = if record.outputs.is_empty() {
                    &record.attributes
                } else {
                    &record.outputs
                };
                drift.changes = compare(recorded, &live.attributes);
                if !drift.changes.is_empty() {
                    drift.kind = DriftKind::Changed;
                }
            }
            Err(e) if e.class() == ErrorClass::NotFound => drift.kind = DriftKind::Missing,
            Err(e) => {
                drift.kind = DriftKind::Unreadable;
                drift.error = Some(e.to_string());
            }
        }

        debug!("{}: {:?}", drift.id, drift.kind);
        Some(drift)
    }
}

/// Attribute-level differences; recorded values holding references are ignored.
fn compare(recorded: &Attributes, live: &Attributes) -> Vec<AttributeDrift> {
    let keys: BTreeSet<&String> = recorded.keys().chain(live.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let old = recorded.get(key);
            let new = live.get(key);
            if old == new || old.is_some_and(|v| v.as_str().is_some_and(|s| s.contains("${"))) {
                return None;
            }
            Some(AttributeDrift {
                field: key.clone(),
                recorded: old.cloned(),
                live: new.cloned(),
            })
        })
        .collect()
}
