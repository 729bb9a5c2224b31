//! Planning module for apply runs.
//!
//! This module compares the desired resources with the recorded state and
//! lays the resulting actions out in dependency order.

mod diff;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use plan::{ExecutionPlan, FieldChange, OrphanedRecord, PlanLevel, PlannedAction};
