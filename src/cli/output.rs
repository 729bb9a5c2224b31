//! Output formatting for CLI commands.
//!
//! This module renders plans, run reports, drift reports and state either
//! as coloured tables for people or as JSON for scripts.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::engine::{Action, DriftKind, DriftReport, EntryOutcome, ReportSummary, RunOutcome, RunReport};
use crate::error::HalyardError;
use crate::graph::ResourceGraph;
use crate::lock::LockLease;
use crate::planner::ExecutionPlan;
use crate::state::{AuditEntry, EnvironmentState, ResourceStatus};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "Level")]
    level: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Report entry row for table display.
#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Tries")]
    attempts: u32,
    #[tabled(rename = "Error")]
    error: String,
}

/// Resource record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Hash")]
    hash: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Whether output is JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats the result of `validate`.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, graph: &ResourceGraph, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "warnings": result.warnings,
                "resources": graph.len(),
                "order": graph.order(),
                "edges": graph.edges(),
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                let _ = writeln!(output, "   Resources: {}", graph.len());
                let _ = writeln!(output, "   Dependency levels: {}", graph.levels().len());
                let _ = writeln!(output, "   Apply order: {}", graph.order().join(" -> "));
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ExecutionPlan, detailed: bool) -> String {
        let mut output = String::new();
        let _ = write!(
            output,
            "\nPlan for '{}' (spec {})\n\n",
            plan.environment,
            ConfigHasher::short_hash(&plan.spec_hash)
        );

        if plan.has_changes() {
            let rows: Vec<PlanActionRow> = plan
                .levels
                .iter()
                .flat_map(|level| level.actions.iter().map(move |a| (level.depth, a)))
                .filter(|(_, a)| a.action != Action::NoOp || detailed)
                .map(|(depth, a)| PlanActionRow {
                    level: depth,
                    action: Self::format_action(a.action),
                    resource: a.id.clone(),
                    resource_type: a.resource_type.clone(),
                    reason: Self::truncate(&a.reason, 40),
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        } else {
            let _ = writeln!(output, "{} No changes required - environment is up to date.", "✓".green());
        }

        if detailed {
            for action in plan.actions().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(output, "\n  {} {}:", Self::format_action(action.action), action.id);
                for change in &action.changes {
                    let _ = writeln!(
                        output,
                        "      {}: {} -> {}",
                        change.field,
                        change.old.as_deref().unwrap_or("(none)"),
                        change.new.as_deref().unwrap_or("(none)")
                    );
                }
            }
        }

        if !plan.orphans.is_empty() {
            let _ = write!(output, "\n{} Recorded but no longer declared (destroy removes them):\n", "⚠".yellow());
            for orphan in &plan.orphans {
                let _ = writeln!(output, "   - {} ({}, {})", orphan.id, orphan.resource_type, orphan.status);
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} unchanged\n",
            plan.count(Action::Create).to_string().green(),
            plan.count(Action::Update).to_string().yellow(),
            plan.count(Action::NoOp),
        );
        output
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ReportJson {
                report,
                summary: report.summary(),
            }),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let mut output = String::new();
        let _ = write!(
            output,
            "\n{} of '{}' (run {})\n\n",
            report.operation, report.environment, report.run_id
        );

        let rows: Vec<ReportRow> = report
            .entries
            .iter()
            .map(|e| ReportRow {
                resource: e.resource_id.clone(),
                action: Self::format_action(e.action),
                outcome: Self::format_outcome(e.outcome),
                status: e.status.map(|s| s.to_string()).unwrap_or_default(),
                attempts: e.attempts,
                error: e.error.as_deref().map(|m| Self::truncate(m, 50)).unwrap_or_default(),
            })
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if let Some(reason) = &report.cancelled {
            let _ = writeln!(output, "\n{} Run cancelled: {reason}", "⚠".yellow());
        }
        if let Some(error) = &report.error {
            let _ = writeln!(output, "\n{} {error}", "✗".red());
        }

        let summary = report.summary();
        let outcome = match report.outcome {
            RunOutcome::Success => format!("{} success", "✓".green()),
            RunOutcome::Failed => format!("{} failed", "✗".red()),
            RunOutcome::PartialFailure => format!("{} partial failure", "⚠".yellow()),
        };
        let _ = write!(
            output,
            "\n{outcome}: {} created, {} updated, {} deleted, {} imported, {} unchanged, {} failed, {} blocked, {} skipped\n",
            summary.created,
            summary.updated,
            summary.deleted,
            summary.imported,
            summary.unchanged,
            summary.failed,
            summary.blocked,
            summary.skipped,
        );
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let drifted = report.drifted();
                if drifted.is_empty() {
                    return format!("{} No drift detected in '{}'.\n", "✓".green(), report.environment);
                }

                let mut output = format!("{} Drift detected in '{}':\n\n", "⚠".yellow(), report.environment);
                for resource in &drifted {
                    let kind = match resource.kind {
                        DriftKind::Changed => "changed".yellow().to_string(),
                        DriftKind::Missing => "missing".red().to_string(),
                        DriftKind::Unreadable => "unreadable".dimmed().to_string(),
                        DriftKind::InSync => "in sync".green().to_string(),
                    };
                    let _ = writeln!(output, "   {} ({}) {kind}", resource.id, resource.provider_id);
                    for change in &resource.changes {
                        let _ = writeln!(
                            output,
                            "      {}: {} -> {}",
                            change.field,
                            json_or_none(change.recorded.as_ref()),
                            json_or_none(change.live.as_ref())
                        );
                    }
                    if let Some(error) = &resource.error {
                        let _ = writeln!(output, "      {error}");
                    }
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted. Run 'halyard apply' to converge.\n",
                    drifted.len(),
                    report.resources.len()
                );
                output
            }
        }
    }

    /// Formats recorded state with the current lock.
    #[must_use]
    pub fn format_state(&self, state: &EnvironmentState, lock: Option<&LockLease>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "state": state, "lock": lock })),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nState: {}\n\n", state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Revision: {}", state.revision);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Lock: {}", Self::format_lock(lock));

                let rows: Vec<RecordRow> = state
                    .records
                    .values()
                    .map(|r| RecordRow {
                        id: r.id.clone(),
                        resource_type: r.resource_type.clone(),
                        status: Self::format_status(r.status),
                        provider_id: r.provider_id.clone().unwrap_or_default(),
                        hash: ConfigHasher::short_hash(&r.attributes_hash).to_string(),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let _ = writeln!(
                            output,
                            "     {} {} {} by {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.outcome,
                            entry.holder,
                            entry.resources.join(", ")
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats the audit log.
    #[must_use]
    pub fn format_audit(&self, entries: &[AuditEntry]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&entries),
            OutputFormat::Text => {
                if entries.is_empty() {
                    return String::from("No audit entries.\n");
                }
                let mut output = String::new();
                for entry in entries {
                    let _ = writeln!(
                        output,
                        "{} {} by {}: {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.action.bold(),
                        entry.actor,
                        entry.detail
                    );
                }
                output
            }
        }
    }

    /// Formats the outcome of `force-unlock`.
    #[must_use]
    pub fn format_unlock(&self, environment: &str, removed: Option<&LockLease>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "environment": environment,
                "removed": removed,
            })),
            OutputFormat::Text => match removed {
                Some(lease) => format!(
                    "{} Removed lock on '{environment}' held by {} since {}\n",
                    "✓".green(),
                    lease.holder_id,
                    lease.acquired_at.format("%Y-%m-%d %H:%M:%S")
                ),
                None => format!("No lock was held on '{environment}'.\n"),
            },
        }
    }

    /// Formats a top-level error.
    #[must_use]
    pub fn format_error(&self, error: &HalyardError) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "status": "error",
                "exit_code": error.exit_code(),
                "message": error.to_string(),
            })),
            OutputFormat::Text => format!("{} {error}", "✗".red()),
        }
    }

    fn format_lock(lock: Option<&LockLease>) -> String {
        match lock {
            None => "unlocked".green().to_string(),
            Some(lease) if lease.is_stale() => format!("stale lease held by {}", lease.holder_id).yellow().to_string(),
            Some(lease) => format!("held by {} ({}s left)", lease.holder_id, lease.remaining_secs())
                .red()
                .to_string(),
        }
    }

    /// Formats an action with color.
    fn format_action(action: Action) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::Update => "~update".yellow().to_string(),
            Action::Delete => "-delete".red().to_string(),
            Action::Import => "<import".cyan().to_string(),
            Action::PublishCredentials => "publish-credentials".cyan().to_string(),
            Action::NoOp => "no-op".dimmed().to_string(),
        }
    }

    fn format_outcome(outcome: EntryOutcome) -> String {
        match outcome {
            EntryOutcome::Succeeded => "succeeded".green().to_string(),
            EntryOutcome::Failed => "failed".red().to_string(),
            EntryOutcome::Blocked => "blocked".yellow().to_string(),
            EntryOutcome::Skipped => "skipped".dimmed().to_string(),
        }
    }

    /// Formats a record status with color.
    fn format_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Active => "active".green().to_string(),
            ResourceStatus::Failed => "failed".red().to_string(),
            ResourceStatus::Deleted => "deleted".dimmed().to_string(),
            other => other.to_string().yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct ReportJson<'a> {
    #[serde(flatten)]
    report: &'a RunReport,
    summary: ReportSummary,
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn json_or_none(value: Option<&serde_json::Value>) -> String {
    value.map_or_else(|| String::from("(none)"), serde_json::Value::to_string)
}
