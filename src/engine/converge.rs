//! Convergence engine (apply).
//!
//! Walks the execution plan level by level. Within a level, actions run
//! concurrently up to the configured degree. A resource is only moved to
//! `Creating` once all of its dependencies are `Active`.
//!
//! Apply is fail-fast: the first resource that ends `Failed` stops every
//! action that has not started yet. Actions already in flight finish, and
//! nothing that reached `Active` is rolled back.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ResourceSpec};
use crate::credentials::{CredentialMaterial, CredentialSink};
use crate::error::{ProviderError, Result, RunError, StateError};
use crate::graph::{GraphBuilder, ResourceGraph, resolve_references};
use crate::planner::{DiffEngine, ExecutionPlan, PlannedAction};
use crate::provider::{Provider, ProviderResource, ResourceRequest};
use crate::state::{EnvironmentState, ResourceRecord, ResourceStatus, RunOperation};

use super::context::RunContext;
use super::ledger::StateLedger;
use super::poll::{Attempted, PollOutcome, poll_until, retry_transient};
use super::report::{Action, EntryOutcome, ReportEntry, ReportRecorder, RunOutcome, RunReport};

/// Applies desired resources to the provider and the state store.
pub struct ConvergenceEngine<'a> {
    ctx: &'a RunContext,
    provider: &'a dyn Provider,
    ledger: &'a StateLedger,
    sink: Option<Arc<dyn CredentialSink>>,
    hasher: ConfigHasher,
}

/// Why a single action did not succeed.
struct ActionFailure {
    message: String,
    attempts: u32,
}

impl ActionFailure {
    fn new(message: impl Into<String>, attempts: u32) -> Self {
        Self {
            message: message.into(),
            attempts,
        }
    }
}

impl<'a> ConvergenceEngine<'a> {
    /// Creates an engine for one run.
    #[must_use]
    pub fn new(ctx: &'a RunContext, provider: &'a dyn Provider, ledger: &'a StateLedger) -> Self {
        Self {
            ctx,
            provider,
            ledger,
            sink: None,
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the sink that receives credential material.
    #[must_use]
    pub fn with_credential_sink(mut self, sink: Option<Arc<dyn CredentialSink>>) -> Self {
        self.sink = sink;
        self
    }

    /// Plans against the ledger's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource changes type.
    pub async fn plan(&self, specs: &[ResourceSpec], graph: &ResourceGraph) -> Result<ExecutionPlan> {
        let snapshot = self.ledger.snapshot().await;
        let diff = DiffEngine::new().compute_diff(specs, Some(&snapshot))?;
        let spec_hash = self.hasher.hash_resources(specs);
        Ok(ExecutionPlan::build(&self.ctx.environment, &spec_hash, &diff, graph))
    }

    /// Converges the environment toward `specs`.
    ///
    /// Resource-level failures are reported, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if planning fails, before anything is touched.
    pub async fn apply(&self, specs: &[ResourceSpec], graph: &ResourceGraph) -> Result<RunReport> {
        let plan = self.plan(specs, graph).await?;
        let by_id: HashMap<&str, &ResourceSpec> = specs.iter().map(|s| (s.id.as_str(), s)).collect();
        let recorder = ReportRecorder::new(&self.ctx.run_id, &self.ctx.environment, RunOperation::Apply);
        let abort = AtomicBool::new(false);

        info!(
            "Applying {} resource(s) to '{}' in {} level(s): {} create, {} update",
            by_id.len(),
            self.ctx.environment,
            plan.levels.len(),
            plan.count(Action::Create),
            plan.count(Action::Update),
        );

        for level in &plan.levels {
            debug!("Dispatching level {} ({} action(s))", level.depth, level.actions.len());
            stream::iter(&level.actions)
                .map(|action| self.dispatch(action, &by_id, graph, &recorder, &abort))
                .buffer_unordered(self.ctx.settings.concurrency)
                .collect::<Vec<()>>()
                .await;
        }

        let cancelled = self.ctx.cancel.reason();
        let outcome = if recorder.any(EntryOutcome::Failed) {
            RunOutcome::Failed
        } else if cancelled.is_some() && recorder.any(EntryOutcome::Skipped) {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        };

        let report = recorder.finish(outcome, cancelled);
        info!("Apply of '{}' finished: {outcome}", self.ctx.environment);
        Ok(report)
    }

    async fn dispatch(
        &self,
        planned: &PlannedAction,
        specs: &HashMap<&str, &ResourceSpec>,
        graph: &ResourceGraph,
        recorder: &ReportRecorder,
        abort: &AtomicBool,
    ) {
        let entry = |outcome| ReportEntry::new(&planned.id, &planned.resource_type, planned.action, outcome);

        if planned.action == Action::NoOp {
            recorder.record(entry(EntryOutcome::Succeeded).with_status(ResourceStatus::Active));
            return;
        }
        if abort.load(Ordering::SeqCst) {
            recorder.record(entry(EntryOutcome::Skipped).with_error("run stopped after an earlier failure"));
            return;
        }
        if self.ctx.is_cancelled() {
            recorder.record(entry(EntryOutcome::Skipped).with_error("run cancelled"));
            return;
        }
        let Some(spec) = specs.get(planned.id.as_str()) else {
            return;
        };

        let seq = recorder.next_seq();
        let started = Utc::now();
        let deadline = Instant::now() + self.ctx.settings.resource_timeout;
        info!("{} {} ({})", planned.action, planned.id, planned.resource_type);

        let dependencies = graph.dependencies_of(&planned.id).cloned().unwrap_or_default();
        let snapshot = self.ledger.snapshot().await;
        if let Some(dep) = dependencies
            .iter()
            .find(|d| snapshot.status_of(d) != Some(ResourceStatus::Active))
        {
            abort.store(true, Ordering::SeqCst);
            recorder.record(
                entry(EntryOutcome::Blocked)
                    .dispatched(seq, started)
                    .with_error(format!("dependency '{dep}' is not active")),
            );
            return;
        }

        let result = self.converge(planned.action, spec, &snapshot, deadline).await;
        match result {
            Ok((resource, attempts)) => {
                recorder.record(
                    entry(EntryOutcome::Succeeded)
                        .dispatched(seq, started)
                        .with_status(ResourceStatus::Active)
                        .with_attempts(attempts),
                );
                if let Some(material) = resource.credentials {
                    self.publish_credentials(spec, material, recorder).await;
                }
            }
            Err(failure) => {
                abort.store(true, Ordering::SeqCst);
                error!("{} of '{}' failed: {}", planned.action, planned.id, failure.message);
                let status = self.mark_failed(&planned.id, &failure.message).await;
                let mut failed = entry(EntryOutcome::Failed)
                    .dispatched(seq, started)
                    .with_error(failure.message)
                    .with_attempts(failure.attempts);
                if let Some(status) = status {
                    failed = failed.with_status(status);
                }
                recorder.record(failed);
            }
        }
    }

    /// Runs one create or update to completion.
    async fn converge(
        &self,
        action: Action,
        spec: &ResourceSpec,
        snapshot: &EnvironmentState,
        deadline: Instant,
    ) -> std::result::Result<(ProviderResource, u32), ActionFailure> {
        let attributes = resolve_references(&spec.attributes, snapshot).map_err(|e| ActionFailure::new(e.to_string(), 0))?;
        let request = ResourceRequest::new(&self.ctx.environment, &spec.id, &spec.resource_type, attributes);
        let hash = self.hasher.hash_resource(spec);

        let next = if action == Action::Create {
            ResourceStatus::Creating
        } else {
            ResourceStatus::Updating
        };
        let provider_id = self
            .ledger
            .update(|state| begin(state, spec, &hash, next))
            .await
            .map_err(|e| ActionFailure::new(e.to_string(), 0))?;

        let Attempted { result, attempts } = match (action, provider_id) {
            (Action::Update, Some(provider_id)) => self.update(&provider_id, &request, deadline).await,
            _ => self.create(&request, deadline).await,
        };
        let resource = result.map_err(|e| ActionFailure::new(e.to_string(), attempts))?;

        if next == ResourceStatus::Creating {
            // Persist the provider id before waiting so a crash here is recoverable.
            let provider_id = resource.provider_id.clone();
            self.ledger
                .update(|state| {
                    let record = record_mut(state, &spec.id)?;
                    record.provider_id = Some(provider_id);
                    Ok(())
                })
                .await
                .map_err(|e| ActionFailure::new(e.to_string(), attempts))?;
        }

        self.wait_until_ready(spec, &resource, deadline)
            .await
            .map_err(|message| ActionFailure::new(message, attempts))?;

        let outputs = resource.attributes.clone();
        let provider_id = resource.provider_id.clone();
        self.ledger
            .update(|state| {
                let record = record_mut(state, &spec.id)?;
                record.provider_id = Some(provider_id);
                record.outputs = outputs;
                record.transition(ResourceStatus::Active)
            })
            .await
            .map_err(|e| ActionFailure::new(e.to_string(), attempts))?;

        info!("{} is active ({})", spec.id, resource.provider_id);
        Ok((resource, attempts))
    }

    /// Creates a resource, re-checking existence before every attempt.
    async fn create(&self, request: &ResourceRequest, deadline: Instant) -> Attempted<ProviderResource> {
        let provider = self.provider;
        let settings = &self.ctx.settings;
        retry_transient("create", &settings.retry, settings.call_timeout, deadline, move || async move {
            if let Some(existing) = provider.lookup(request).await? {
                warn!(
                    "{} already exists as {}; adopting it",
                    request.logical_id, existing.provider_id
                );
                return Ok(existing);
            }
            provider.create(request).await
        })
        .await
    }

    async fn update(&self, provider_id: &str, request: &ResourceRequest, deadline: Instant) -> Attempted<ProviderResource> {
        let provider = self.provider;
        let settings = &self.ctx.settings;
        retry_transient("update", &settings.retry, settings.call_timeout, deadline, move || {
            provider.update(provider_id, request)
        })
        .await
    }

    /// Waits for the provider to report the resource ready. Not cancellable.
    async fn wait_until_ready(
        &self,
        spec: &ResourceSpec,
        resource: &ProviderResource,
        deadline: Instant,
    ) -> std::result::Result<(), String> {
        let provider = self.provider;
        let resource_type = spec.resource_type.as_str();
        let provider_id = resource.provider_id.as_str();
        let budget = deadline.saturating_duration_since(Instant::now());

        let outcome = poll_until(
            move || provider.is_ready(resource_type, provider_id),
            &self.ctx.settings.readiness_poll,
            budget,
            None,
        )
        .await
        .map_err(|e: ProviderError| e.to_string())?;

        match outcome {
            PollOutcome::Ready { attempts } => {
                if attempts > 1 {
                    debug!("{} ready after {attempts} polls", spec.id);
                }
                Ok(())
            }
            PollOutcome::TimedOut { .. } => Err(RunError::ResourceTimeout {
                resource: spec.id.clone(),
                secs: self.ctx.settings.resource_timeout.as_secs(),
            }
            .to_string()),
            PollOutcome::Exhausted { attempts } | PollOutcome::Cancelled { attempts } => Err(RunError::NotReady {
                resource: spec.id.clone(),
                attempts,
            }
            .to_string()),
        }
    }

    async fn publish_credentials(&self, spec: &ResourceSpec, material: CredentialMaterial, recorder: &ReportRecorder) {
        let entry = |outcome| ReportEntry::new(&spec.id, &spec.resource_type, Action::PublishCredentials, outcome);
        let seq = recorder.next_seq();
        let started = Utc::now();

        let Some(sink) = &self.sink else {
            warn!("{} returned credentials but no credential sink is configured", spec.id);
            recorder.record(
                entry(EntryOutcome::Failed)
                    .dispatched(seq, started)
                    .with_error(format!("no credential sink configured for {}", material.recipient)),
            );
            return;
        };

        match sink.publish(&material.recipient, &material.payload).await {
            Ok(()) => recorder.record(entry(EntryOutcome::Succeeded).dispatched(seq, started).with_attempts(1)),
            Err(e) => {
                error!("{e}");
                recorder.record(
                    entry(EntryOutcome::Failed)
                        .dispatched(seq, started)
                        .with_attempts(1)
                        .with_error(e.to_string()),
                );
            }
        }
    }

    async fn mark_failed(&self, id: &str, message: &str) -> Option<ResourceStatus> {
        let current = self.ledger.snapshot().await.status_of(id)?;
        if !current.is_transitional() {
            return Some(current);
        }

        let result = self
            .ledger
            .update(|state| {
                let record = record_mut(state, id)?;
                record.fail(message)?;
                Ok(record.status)
            })
            .await;
        match result {
            Ok(status) => Some(status),
            Err(e) => {
                error!("Could not record failure of '{id}': {e}");
                None
            }
        }
    }
}

fn record_mut<'s>(state: &'s mut EnvironmentState, id: &str) -> std::result::Result<&'s mut ResourceRecord, StateError> {
    state.record_mut(id).ok_or_else(|| StateError::RecordNotFound {
        resource: id.to_string(),
    })
}

/// Stores the desired attributes on the record and moves it to `next`.
///
/// Returns the provider id already known for the resource.
fn begin(
    state: &mut EnvironmentState,
    spec: &ResourceSpec,
    hash: &str,
    next: ResourceStatus,
) -> std::result::Result<Option<String>, StateError> {
    let dependencies = GraphBuilder::spec_dependencies(spec);
    match state.record_mut(&spec.id) {
        None => state.set_record(ResourceRecord::planned(
            &spec.id,
            &spec.resource_type,
            spec.attributes.clone(),
            hash,
            dependencies,
        )),
        Some(record) => {
            if record.status == ResourceStatus::Deleted {
                record.transition(ResourceStatus::Planned)?;
                record.provider_id = None;
                record.outputs.clear();
                record.imported = false;
            }
            record.resource_type.clone_from(&spec.resource_type);
            record.attributes = spec.attributes.clone();
            record.attributes_hash = hash.to_string();
            record.dependency_ids = dependencies;
        }
    }

    let record = record_mut(state, &spec.id)?;
    record.transition(next)?;
    Ok(record.provider_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MockCredentialSink;
    use crate::engine::EngineSettings;
    use crate::error::CredentialError;
    use crate::provider::SimulatedProvider;
    use crate::state::{MemoryStateStore, SharedStateStore};

    fn chain() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("vpc", "network.vpc").with_attribute("cidr", "10.0.0.0/16"),
            ResourceSpec::new("subnet", "network.subnet")
                .with_attribute("vpc_id", "${vpc}")
                .with_attribute("cidr", "10.0.1.0/24"),
            ResourceSpec::new("lb", "lb.load_balancer").with_attribute("subnet", "${subnet.arn}"),
            ResourceSpec::new("tg", "lb.target_group").depends_on("lb"),
        ]
    }

    async fn ledger() -> StateLedger {
        let store: SharedStateStore = Arc::new(MemoryStateStore::default());
        StateLedger::open(store, "dev").await.expect("ledger")
    }

    fn ctx() -> RunContext {
        RunContext::new("dev", "tester", EngineSettings::fast())
    }

    #[tokio::test]
    async fn test_apply_creates_in_dependency_order_and_resolves_references() {
        let provider = SimulatedProvider::new();
        let ledger = ledger().await;
        let ctx = ctx();
        let specs = chain();
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let report = ConvergenceEngine::new(&ctx, &provider, &ledger)
            .apply(&specs, &graph)
            .await
            .expect("apply");

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(provider.calls_for("create"), vec!["vpc", "subnet", "lb", "tg"]);

        let state = ledger.snapshot().await;
        assert!(state.records.values().all(ResourceRecord::is_active));
        let vpc_id = state.record("vpc").and_then(|r| r.provider_id.clone()).expect("vpc id");
        let subnet = provider.live("subnet").expect("subnet");
        assert_eq!(subnet.attributes.get("vpc_id"), Some(&serde_json::Value::String(vpc_id)));
        // Desired attributes are stored unresolved.
        assert_eq!(
            state.record("subnet").and_then(|r| r.attributes.get("vpc_id")),
            Some(&serde_json::Value::String(String::from("${vpc}")))
        );
    }

    #[tokio::test]
    async fn test_second_apply_is_all_noop() {
        let provider = SimulatedProvider::new();
        let ledger = ledger().await;
        let specs = chain();
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let first = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("first");
        assert_eq!(first.summary().created, 4);

        let second = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("second");
        assert!(second.is_noop());
        assert_eq!(second.outcome, RunOutcome::Success);
        assert_eq!(provider.calls_for("create").len(), 4);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = SimulatedProvider::new();
        provider.fail_next("create", "vpc", ProviderError::transient("throttled"), 2);
        let ledger = ledger().await;
        let specs = vec![ResourceSpec::new("vpc", "network.vpc")];
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let report = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("apply");
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.entry("vpc").map(|e| e.attempts), Some(3));
    }

    #[tokio::test]
    async fn test_lost_create_response_does_not_duplicate() {
        let provider = SimulatedProvider::new();
        provider.lose_create_response("vpc");
        let ledger = ledger().await;
        let specs = vec![ResourceSpec::new("vpc", "network.vpc")];
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let report = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("apply");
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(provider.resource_count(), 1);
        assert_eq!(provider.calls_for("create").len(), 1);
    }

    #[tokio::test]
    async fn test_permission_error_fails_fast_without_rollback() {
        let provider = SimulatedProvider::new();
        provider.fail_next("create", "subnet", ProviderError::permission("ec2:CreateSubnet denied"), 1);
        let ledger = ledger().await;
        let specs = chain();
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let report = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("apply");

        assert_eq!(report.outcome, RunOutcome::Failed);
        let subnet = report.entry("subnet").expect("subnet");
        assert_eq!(subnet.outcome, EntryOutcome::Failed);
        assert_eq!(subnet.attempts, 1);
        assert_eq!(report.entry("lb").map(|e| e.outcome), Some(EntryOutcome::Skipped));
        assert_eq!(report.entry("tg").map(|e| e.outcome), Some(EntryOutcome::Skipped));

        let state = ledger.snapshot().await;
        assert_eq!(state.status_of("vpc"), Some(ResourceStatus::Active));
        assert_eq!(state.status_of("subnet"), Some(ResourceStatus::Failed));
        assert_eq!(state.status_of("lb"), None);
    }

    #[tokio::test]
    async fn test_failed_record_is_retried_by_next_apply() {
        let provider = SimulatedProvider::new();
        provider.fail_next("create", "vpc", ProviderError::invalid_spec("bad cidr"), 1);
        let ledger = ledger().await;
        let specs = vec![ResourceSpec::new("vpc", "network.vpc")];
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let first = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("first");
        assert_eq!(first.outcome, RunOutcome::Failed);

        let second = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("second");
        assert_eq!(second.outcome, RunOutcome::Success);
        assert_eq!(second.entry("vpc").map(|e| e.action), Some(Action::Create));
    }

    #[tokio::test]
    async fn test_changed_attributes_update_in_place() {
        let provider = SimulatedProvider::new();
        let ledger = ledger().await;
        let specs = vec![ResourceSpec::new("vpc", "network.vpc").with_attribute("cidr", "10.0.0.0/16")];
        let graph = GraphBuilder::new().build(&specs).expect("graph");
        ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("create");

        let changed = vec![ResourceSpec::new("vpc", "network.vpc").with_attribute("cidr", "10.9.0.0/16")];
        let report = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&changed, &graph).await.expect("update");

        assert_eq!(report.entry("vpc").map(|e| e.action), Some(Action::Update));
        assert_eq!(provider.calls_for("update"), vec!["vpc"]);
        let live = provider.live("vpc").expect("live");
        assert_eq!(live.attributes.get("cidr"), Some(&serde_json::json!("10.9.0.0/16")));
    }

    #[tokio::test]
    async fn test_waits_for_readiness_before_dependents() {
        let provider = SimulatedProvider::new();
        provider.delay_readiness("vpc", 3);
        let ledger = ledger().await;
        let specs = chain();
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let report = ConvergenceEngine::new(&ctx(), &provider, &ledger).apply(&specs, &graph).await.expect("apply");
        assert_eq!(report.outcome, RunOutcome::Success);

        let vpc = report.entry("vpc").expect("vpc");
        let subnet = report.entry("subnet").expect("subnet");
        assert!(vpc.completed_seq < subnet.dispatched_seq);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_remaining_levels() {
        let provider = SimulatedProvider::new();
        let ledger = ledger().await;
        let ctx = ctx();
        ctx.cancel.cancel("operator interrupt");
        let specs = chain();
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let report = ConvergenceEngine::new(&ctx, &provider, &ledger).apply(&specs, &graph).await.expect("apply");
        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(report.cancelled.as_deref(), Some("operator interrupt"));
        assert_eq!(report.summary().skipped, 4);
        assert_eq!(provider.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_credentials_are_published() {
        let provider = SimulatedProvider::new().with_credentials("iam.user", "ci-team");
        let mut sink = MockCredentialSink::new();
        sink.expect_publish()
            .withf(|recipient, _| recipient == "ci-team")
            .times(1)
            .returning(|_, _| Ok(()));
        let sink: Arc<dyn CredentialSink> = Arc::new(sink);

        let ledger = ledger().await;
        let specs = vec![ResourceSpec::new("deployer", "iam.user")];
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let ctx = ctx();
        let report = ConvergenceEngine::new(&ctx, &provider, &ledger)
            .with_credential_sink(Some(sink))
            .apply(&specs, &graph)
            .await
            .expect("apply");
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.ids_with_action(Action::PublishCredentials), vec!["deployer"]);
    }

    #[tokio::test]
    async fn test_credential_publish_failure_fails_run_but_keeps_resource() {
        let provider = SimulatedProvider::new().with_credentials("iam.user", "ci-team");
        let mut sink = MockCredentialSink::new();
        sink.expect_publish().returning(|recipient, _| {
            Err(CredentialError::PublishFailed {
                recipient: recipient.to_string(),
                message: String::from("vault sealed"),
            })
        });
        let sink: Arc<dyn CredentialSink> = Arc::new(sink);

        let ledger = ledger().await;
        let specs = vec![ResourceSpec::new("deployer", "iam.user")];
        let graph = GraphBuilder::new().build(&specs).expect("graph");

        let ctx = ctx();
        let report = ConvergenceEngine::new(&ctx, &provider, &ledger)
            .with_credential_sink(Some(sink))
            .apply(&specs, &graph)
            .await
            .expect("apply");

        assert_eq!(report.outcome, RunOutcome::Failed);
        let publish = report
            .entries
            .iter()
            .find(|e| e.action == Action::PublishCredentials)
            .expect("publish entry");
        assert_eq!(publish.outcome, EntryOutcome::Failed);
        assert_eq!(ledger.snapshot().await.status_of("deployer"), Some(ResourceStatus::Active));
    }
}
