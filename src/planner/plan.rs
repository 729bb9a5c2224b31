//! Execution plan types and construction.
//!
//! A plan is the diff laid out on the dependency graph: one [`PlanLevel`] per
//! depth, in the order apply will walk them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::engine::Action;
use crate::graph::ResourceGraph;

use super::diff::{DiffDetail, DiffResult, DiffType, ResourceDiff};

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Environment the plan targets.
    pub environment: String,
    /// Hash of the desired resource set.
    pub spec_hash: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Actions grouped by dependency depth, ascending.
    pub levels: Vec<PlanLevel>,
    /// Records that are no longer declared.
    pub orphans: Vec<OrphanedRecord>,
}

/// Actions that may run concurrently.
#[derive(Debug, Clone, Serialize)]
pub struct PlanLevel {
    /// Dependency depth.
    pub depth: usize,
    /// Actions at this depth.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Resource id.
    pub id: String,
    /// Resource type.
    pub resource_type: String,
    /// What apply will do.
    pub action: Action,
    /// Why.
    pub reason: String,
    /// Field-level changes.
    pub changes: Vec<FieldChange>,
}

/// A changed field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldChange {
    /// Field name.
    pub field: String,
    /// Recorded value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    /// Desired value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

/// A record present in state but absent from the desired resources.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanedRecord {
    /// Resource id.
    pub id: String,
    /// Resource type.
    pub resource_type: String,
    /// Recorded status.
    pub status: String,
}

impl From<&DiffDetail> for FieldChange {
    fn from(detail: &DiffDetail) -> Self {
        Self {
            field: detail.field.clone(),
            old: detail.old_value.clone(),
            new: detail.new_value.clone(),
        }
    }
}

impl ExecutionPlan {
    /// Lays a diff out on the graph.
    ///
    /// Every desired resource in `diff` must be a node of `graph`.
    #[must_use]
    pub fn build(environment: &str, spec_hash: &str, diff: &DiffResult, graph: &ResourceGraph) -> Self {
        let by_id: HashMap<&str, &ResourceDiff> = diff.diffs.iter().map(|d| (d.id.as_str(), d)).collect();

        let levels = graph
            .levels()
            .into_iter()
            .enumerate()
            .map(|(depth, ids)| PlanLevel {
                depth,
                actions: ids
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()))
                    .map(|d| PlannedAction {
                        id: d.id.clone(),
                        resource_type: d.resource_type.clone(),
                        action: action_for(d.diff_type),
                        reason: d.reason.clone(),
                        changes: d.details.iter().map(FieldChange::from).collect(),
                    })
                    .collect(),
            })
            .filter(|level| !level.actions.is_empty())
            .collect();

        let orphans = diff
            .orphans()
            .into_iter()
            .map(|d| OrphanedRecord {
                id: d.id.clone(),
                resource_type: d.resource_type.clone(),
                status: d.current_status.map(|s| s.to_string()).unwrap_or_default(),
            })
            .collect();

        Self {
            environment: environment.to_string(),
            spec_hash: spec_hash.to_string(),
            created_at: Utc::now(),
            levels,
            orphans,
        }
    }

    /// All actions in walk order.
    pub fn actions(&self) -> impl Iterator<Item = &PlannedAction> {
        self.levels.iter().flat_map(|l| l.actions.iter())
    }

    /// The action planned for a resource.
    #[must_use]
    pub fn action_for(&self, id: &str) -> Option<Action> {
        self.actions().find(|a| a.id == id).map(|a| a.action)
    }

    /// Returns true if apply would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions().any(|a| a.action != Action::NoOp)
    }

    /// Number of actions of a kind.
    #[must_use]
    pub fn count(&self, action: Action) -> usize {
        self.actions().filter(|a| a.action == action).count()
    }
}

const fn action_for(diff_type: DiffType) -> Action {
    match diff_type {
        DiffType::Create => Action::Create,
        DiffType::Update => Action::Update,
        DiffType::NoChange | DiffType::Orphaned => Action::NoOp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceSpec;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;

    #[test]
    fn test_plan_follows_dependency_levels() {
        let specs = vec![
            ResourceSpec::new("tg", "lb.target_group").with_attribute("lb", "${lb}"),
            ResourceSpec::new("lb", "lb.load_balancer").depends_on("subnet"),
            ResourceSpec::new("subnet", "network.subnet").depends_on("vpc"),
            ResourceSpec::new("vpc", "network.vpc"),
            ResourceSpec::new("bucket", "storage.bucket"),
        ];
        let graph = GraphBuilder::new().build(&specs).expect("graph");
        let diff = DiffEngine::new().compute_diff(&specs, None).expect("diff");
        let plan = ExecutionPlan::build("dev", "abc", &diff, &graph);

        let order: Vec<&str> = plan.actions().map(|a| a.id.as_str()).collect();
        let pos = |id: &str| order.iter().position(|x| *x == id).expect("present");
        assert!(pos("vpc") < pos("subnet"));
        assert!(pos("subnet") < pos("lb"));
        assert!(pos("lb") < pos("tg"));
        assert_eq!(plan.levels.len(), 4);
        assert_eq!(plan.levels[0].actions.len(), 2);
        assert_eq!(plan.count(Action::Create), 5);
        assert!(plan.has_changes());
        assert_eq!(plan.action_for("bucket"), Some(Action::Create));
    }
}
