//! Run coordinator.
//!
//! This module ties the pieces of a run together: it validates the desired
//! state and builds the dependency graph before touching anything, takes
//! the environment lock, keeps it alive with a heartbeat, arms the run
//! timeout, hands the work to the convergence engine or the teardown
//! sequencer, and releases the lock when the run is over.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, DeployConfig, ResourceSpec, ValidationResult};
use crate::credentials::CredentialSink;
use crate::engine::{
    ConvergenceEngine, DriftDetector, DriftReport, EngineSettings, ImportRequest, RunContext, RunReport,
    StateLedger, TeardownSequencer, import_resource,
};
use crate::error::{ConfigError, Result};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::lock::{HeartbeatHandle, LockLease, LockManager, generate_holder_id};
use crate::planner::{DiffEngine, ExecutionPlan};
use crate::provider::{Provider, SharedProvider};
use crate::state::{AuditEntry, EnvironmentState, SharedStateStore};

/// Coordinates plan, apply, destroy, import and drift for one environment.
pub struct Orchestrator {
    /// Desired state.
    config: DeployConfig,
    /// State store shared with the lock manager.
    store: SharedStateStore,
    /// Provider capability; only runs that talk to the provider need one.
    provider: Option<SharedProvider>,
    /// Credential hand-off.
    sink: Option<Arc<dyn CredentialSink>>,
    /// Environment locks.
    locks: LockManager,
    /// Engine tuning.
    settings: EngineSettings,
    /// Identity written into leases and history.
    holder_id: String,
    /// How long to wait for a held lock.
    lock_wait: Option<Duration>,
}

/// Everything that lives exactly as long as a locked run.
struct ActiveRun {
    ctx: RunContext,
    lease: LockLease,
    heartbeat: HeartbeatHandle,
    timer: JoinHandle<()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("environment", &self.config.environment.name)
            .field("backend", &self.store.backend_type())
            .field("provider", &self.provider.as_ref().map(|p| p.name().to_string()))
            .field("holder_id", &self.holder_id)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with settings taken from the configuration.
    #[must_use]
    pub fn new(config: DeployConfig, store: SharedStateStore) -> Self {
        let settings = EngineSettings::from_config(&config.engine);
        let lock_wait = config.engine.lock_wait();
        Self {
            locks: LockManager::new(store.clone()),
            config,
            store,
            provider: None,
            sink: None,
            settings,
            holder_id: generate_holder_id(),
            lock_wait,
        }
    }

    /// Sets the provider.
    #[must_use]
    pub fn with_provider(mut self, provider: SharedProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets the credential sink.
    #[must_use]
    pub fn with_credential_sink(mut self, sink: Option<Arc<dyn CredentialSink>>) -> Self {
        self.sink = sink;
        self
    }

    /// Overrides the lock holder identity.
    #[must_use]
    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    /// Overrides how long to wait for a held lock.
    #[must_use]
    pub const fn with_lock_wait(mut self, wait: Option<Duration>) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Overrides the engine settings.
    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Environment this orchestrator acts on.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.config.environment.name
    }

    /// Lock holder identity.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn provider(&self) -> Result<&dyn Provider> {
        self.provider.as_deref().ok_or_else(|| {
            ConfigError::validation("a provider endpoint is required for this command", "provider.endpoint").into()
        })
    }

    /// Validates the configuration and builds the graph of the desired
    /// resources. Reads nothing and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns a schema or cycle error.
    pub fn validate(&self) -> Result<(ValidationResult, ResourceGraph)> {
        let validation = ConfigValidator::new().validate(&self.config)?;
        let graph = GraphBuilder::new().build(&self.config.resources)?;
        debug!("Pre-flight passed: {} resource(s), {} edge(s)", graph.len(), graph.edges().len());
        Ok((validation, graph))
    }

    /// Computes what an apply would do, without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns a schema, cycle, or store error.
    pub async fn plan(&self) -> Result<ExecutionPlan> {
        let (_, graph) = self.validate()?;
        let state = self.store.load(self.environment()).await?;
        let diff = DiffEngine::new().compute_diff(&self.config.resources, state.as_ref())?;
        let spec_hash = ConfigHasher::new().hash_resources(&self.config.resources);
        let plan = ExecutionPlan::build(self.environment(), &spec_hash, &diff, &graph);
        for orphan in &plan.orphans {
            warn!("'{}' is recorded but no longer declared; destroy removes it", orphan.id);
        }
        Ok(plan)
    }

    /// Converges the environment toward the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the run could not start (invalid spec, lock
    /// held, store unavailable). Resource failures are in the report.
    pub async fn apply(&self) -> Result<RunReport> {
        let (_, graph) = self.validate()?;
        // Type changes against recorded resources are spec errors; reject
        // them before the lock is taken or any record is recovered.
        let state = self.store.load(self.environment()).await?;
        DiffEngine::new().compute_diff(&self.config.resources, state.as_ref())?;
        let provider = self.provider()?;
        let run = self.start_run().await?;
        let result = self.run_apply(&run.ctx, provider, &graph).await;
        self.finish_run(run).await;
        result
    }

    async fn run_apply(&self, ctx: &RunContext, provider: &dyn Provider, graph: &ResourceGraph) -> Result<RunReport> {
        let ledger = StateLedger::open(self.store.clone(), self.environment()).await?;
        ledger.recover().await?;

        let report = ConvergenceEngine::new(ctx, provider, &ledger)
            .with_credential_sink(self.sink.clone())
            .apply(&self.config.resources, graph)
            .await?;

        let spec_hash = ConfigHasher::new().hash_resources(&self.config.resources);
        self.record_history(&ledger, &report, Some(spec_hash)).await;
        Ok(report)
    }

    /// Tears down every recorded resource of the environment, orphans included.
    ///
    /// # Errors
    ///
    /// Returns an error if the run could not start. Resource failures are
    /// in the report.
    pub async fn destroy(&self) -> Result<RunReport> {
        ConfigValidator::new().validate(&self.config)?;
        let provider = self.provider()?;
        let run = self.start_run().await?;
        let result = self.run_destroy(&run.ctx, provider).await;
        self.finish_run(run).await;
        result
    }

    async fn run_destroy(&self, ctx: &RunContext, provider: &dyn Provider) -> Result<RunReport> {
        let ledger = StateLedger::open(self.store.clone(), self.environment()).await?;
        let graph = GraphBuilder::new().from_records(&ledger.snapshot().await, Some(&self.config.resources))?;
        ledger.recover().await?;

        let report = TeardownSequencer::new(ctx, provider, &ledger)
            .destroy(&graph)
            .await?;

        if !ledger.snapshot().await.is_fully_deleted() {
            self.record_history(&ledger, &report, None).await;
        }
        Ok(report)
    }

    /// Attaches an existing provider resource to a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already managed, the declared type
    /// disagrees, the resource cannot be read, or the lock is held.
    pub async fn import(&self, id: &str, resource_type: &str, provider_id: &str) -> Result<RunReport> {
        ConfigValidator::new().validate(&self.config)?;
        let spec = self.config.resource(id);
        if let Some(spec) = spec {
            if spec.resource_type != resource_type {
                return Err(ConfigError::validation(
                    format!("'{id}' is declared as {}, not {resource_type}", spec.resource_type),
                    "type",
                )
                .into());
            }
        }

        let provider = self.provider()?;
        let run = self.start_run().await?;
        let request = ImportRequest {
            id,
            resource_type,
            provider_id,
            spec,
        };
        let result = self.run_import(&run.ctx, provider, &request).await;
        self.finish_run(run).await;
        result
    }

    async fn run_import(&self, ctx: &RunContext, provider: &dyn Provider, request: &ImportRequest<'_>) -> Result<RunReport> {
        let ledger = StateLedger::open(self.store.clone(), self.environment()).await?;
        ledger.recover().await?;
        let report = import_resource(ctx, provider, &ledger, request).await?;
        self.record_history(&ledger, &report, None).await;
        Ok(report)
    }

    /// Compares recorded state with the provider. Takes no lock and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn drift(&self) -> Result<DriftReport> {
        let provider = self.provider()?;
        let state = self
            .store
            .load(self.environment())
            .await?
            .unwrap_or_else(|| EnvironmentState::new(self.environment()));
        Ok(DriftDetector::new(provider, &self.settings)
            .detect(&state)
            .await)
    }

    /// Removes the environment's lease whoever holds it, and audits it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn force_unlock(&self, actor: &str, reason: &str) -> Result<Option<LockLease>> {
        self.locks.force_release(self.environment(), actor, reason).await
    }

    /// The environment's current lease, stale or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn lock_status(&self) -> Result<Option<LockLease>> {
        self.locks.current(self.environment()).await
    }

    /// The environment's recorded state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn state(&self) -> Result<Option<EnvironmentState>> {
        self.store.load(self.environment()).await
    }

    /// The environment's audit log, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn audit(&self) -> Result<Vec<AuditEntry>> {
        self.store.list_audit(self.environment()).await
    }

    async fn start_run(&self) -> Result<ActiveRun> {
        let ctx = RunContext::new(self.environment(), &self.holder_id, self.settings.clone());
        let lease = self
            .locks
            .acquire_with_wait(
                self.environment(),
                &self.holder_id,
                self.config.engine.lock_ttl(),
                self.lock_wait,
                &self.settings.retry.backoff,
            )
            .await?;
        info!("Run {} started on '{}' as {}", ctx.run_id, ctx.environment, self.holder_id);

        let heartbeat = self.locks.spawn_heartbeat(
            lease.clone(),
            self.config.engine.heartbeat_interval(),
            ctx.cancel.clone(),
        );
        let timer = ctx.arm_run_timeout();
        Ok(ActiveRun {
            ctx,
            lease,
            heartbeat,
            timer,
        })
    }

    async fn finish_run(&self, run: ActiveRun) {
        run.timer.abort();
        let lease = match run.heartbeat.stop().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("{e}");
                run.lease
            }
        };
        // A failed release leaves the lease to expire after its ttl.
        if let Err(e) = self.locks.release(&lease).await {
            warn!("Could not release lock on '{}': {e}", lease.scope);
        }
        info!("Run {} finished on '{}'", run.ctx.run_id, run.ctx.environment);
    }

    async fn record_history(&self, ledger: &StateLedger, report: &RunReport, spec_hash: Option<String>) {
        let entry = report.history_entry(&self.holder_id, spec_hash);
        if let Err(e) = ledger
            .update(|state| {
                state.add_history(entry);
                Ok(())
            })
            .await
        {
            warn!("Could not record run history: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentConfig;
    use crate::credentials::MockCredentialSink;
    use crate::engine::{Action, EntryOutcome, RunOutcome};
    use crate::error::{CredentialError, EXIT_INVALID_SPEC, EXIT_LOCK_CONTENTION, HalyardError};
    use crate::provider::SimulatedProvider;
    use crate::state::{MemoryStateStore, ResourceStatus, StateStore};

    fn config(resources: Vec<ResourceSpec>) -> DeployConfig {
        DeployConfig {
            environment: EnvironmentConfig {
                name: String::from("dev"),
                project: None,
            },
            state: crate::config::StateConfig::default(),
            provider: crate::config::ProviderConfig::default(),
            engine: crate::config::EngineConfig::default(),
            credentials: None,
            resources,
        }
    }

    fn chain() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("vpc", "network.vpc").with_attribute("cidr", "10.0.0.0/16"),
            ResourceSpec::new("subnet", "network.subnet").with_attribute("vpc_id", "${vpc}"),
            ResourceSpec::new("lb", "lb.load_balancer").with_attribute("subnet_id", "${subnet}"),
            ResourceSpec::new("tg", "lb.target_group").with_attribute("lb_arn", "${lb.arn}"),
        ]
    }

    struct Harness {
        store: Arc<MemoryStateStore>,
        provider: Arc<SimulatedProvider>,
    }

    impl Harness {
        fn new(provider: SimulatedProvider) -> Self {
            Self {
                store: Arc::new(MemoryStateStore::default()),
                provider: Arc::new(provider),
            }
        }

        fn orchestrator(&self, resources: Vec<ResourceSpec>) -> Orchestrator {
            let store: SharedStateStore = self.store.clone();
            let provider: SharedProvider = self.provider.clone();
            Orchestrator::new(config(resources), store)
                .with_provider(provider)
                .with_holder_id("tester")
                .with_settings(EngineSettings::fast())
        }
    }

    fn order(report: &RunReport, action: Action) -> Vec<&str> {
        let mut entries: Vec<_> = report
            .entries
            .iter()
            .filter(|e| e.action == action && e.outcome == EntryOutcome::Succeeded)
            .collect();
        entries.sort_by_key(|e| e.completed_seq);
        entries.iter().map(|e| e.resource_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_and_ordered() {
        let harness = Harness::new(SimulatedProvider::new());
        let orchestrator = harness.orchestrator(chain());

        let first = orchestrator.apply().await.expect("first apply");
        assert_eq!(first.outcome, RunOutcome::Success);
        assert_eq!(order(&first, Action::Create), vec!["vpc", "subnet", "lb", "tg"]);

        let second = orchestrator.apply().await.expect("second apply");
        assert!(second.is_noop());
        assert_eq!(second.exit_code(), 0);
        assert_eq!(harness.provider.calls_for("create").len(), 4);

        let state = orchestrator.state().await.expect("load").expect("state");
        assert_eq!(state.history.len(), 2);
        assert!(orchestrator.lock_status().await.expect("lease").is_none());
    }

    #[tokio::test]
    async fn test_destroy_reverses_apply_order() {
        let harness = Harness::new(SimulatedProvider::new());
        let orchestrator = harness.orchestrator(chain());
        orchestrator.apply().await.expect("apply");

        let report = orchestrator.destroy().await.expect("destroy");

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(order(&report, Action::Delete), vec!["tg", "lb", "subnet", "vpc"]);
        assert!(!harness.store.exists("dev").await.expect("exists"));
        assert_eq!(harness.provider.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_stuck_attachment_gives_partial_teardown() {
        let harness = Harness::new(SimulatedProvider::new().with_attachment_type("lb.load_balancer"));
        let orchestrator = harness.orchestrator(chain());
        orchestrator.apply().await.expect("apply");
        harness.provider.stick_attachment("lb");

        let report = orchestrator.destroy().await.expect("destroy");

        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(report.exit_code(), 1);
        let outcome = |id: &str| report.entry(id).map(|e| e.outcome);
        assert_eq!(outcome("tg"), Some(EntryOutcome::Succeeded));
        assert_eq!(outcome("lb"), Some(EntryOutcome::Failed));
        assert_eq!(outcome("subnet"), Some(EntryOutcome::Blocked));
        assert_eq!(outcome("vpc"), Some(EntryOutcome::Blocked));

        let state = orchestrator.state().await.expect("load").expect("state");
        assert_eq!(state.status_of("lb"), Some(ResourceStatus::Failed));
        assert_eq!(state.status_of("vpc"), Some(ResourceStatus::Active));
        assert_eq!(state.history.len(), 2);
        assert!(orchestrator.lock_status().await.expect("lease").is_none());
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_anything_is_written() {
        let harness = Harness::new(SimulatedProvider::new());
        let orchestrator = harness.orchestrator(vec![
            ResourceSpec::new("a", "network.vpc").depends_on("b"),
            ResourceSpec::new("b", "network.vpc").depends_on("a"),
        ]);

        let err = orchestrator.apply().await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INVALID_SPEC);
        let err = orchestrator.plan().await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INVALID_SPEC);

        assert!(harness.store.load("dev").await.expect("load").is_none());
        assert!(harness.store.read_lease("dev").await.expect("lease").is_none());
        assert!(harness.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_without_provider_is_rejected_before_locking() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::default());
        let orchestrator = Orchestrator::new(config(chain()), store.clone());

        let err = orchestrator.apply().await.unwrap_err();

        assert_eq!(err.exit_code(), EXIT_INVALID_SPEC);
        assert!(store.read_lease("dev").await.expect("lease").is_none());
        assert_eq!(orchestrator.plan().await.expect("plan").count(Action::Create), 4);
    }

    #[tokio::test]
    async fn test_type_change_is_rejected_before_locking() {
        let harness = Harness::new(SimulatedProvider::new());
        harness.orchestrator(chain()).apply().await.expect("apply");

        // Leave an interrupted record behind so recovery would show up as a write.
        let mut state = harness.store.load("dev").await.expect("load").expect("state");
        let expected = state.revision;
        state.records.get_mut("tg").expect("tg record").status = ResourceStatus::Updating;
        state.revision += 1;
        harness.store.save(&state, expected).await.expect("save");

        let mut resources = chain();
        resources[0] = ResourceSpec::new("vpc", "network.vpc_v2").with_attribute("cidr", "10.0.0.0/16");
        let orchestrator = harness.orchestrator(resources);

        let err = orchestrator.apply().await.unwrap_err();

        assert_eq!(err.exit_code(), EXIT_INVALID_SPEC);
        assert!(harness.store.read_lease("dev").await.expect("lease").is_none());
        let after = harness.store.load("dev").await.expect("load").expect("state");
        assert_eq!(after.revision, state.revision);
        assert_eq!(after.status_of("tg"), Some(ResourceStatus::Updating));
        assert!(harness.provider.calls_for("update").is_empty());
    }

    #[tokio::test]
    async fn test_held_lock_rejects_run() {
        let harness = Harness::new(SimulatedProvider::new());
        let orchestrator = harness.orchestrator(chain());
        let store: SharedStateStore = harness.store.clone();
        LockManager::new(store)
            .acquire("dev", "someone-else", Duration::from_secs(300))
            .await
            .expect("foreign lease");

        let err = orchestrator.apply().await.unwrap_err();

        assert!(matches!(err, HalyardError::Lock(_)));
        assert_eq!(err.exit_code(), EXIT_LOCK_CONTENTION);
        assert!(harness.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_force_unlock_frees_the_environment_and_is_audited() {
        let harness = Harness::new(SimulatedProvider::new());
        let orchestrator = harness.orchestrator(chain());
        let store: SharedStateStore = harness.store.clone();
        LockManager::new(store)
            .acquire("dev", "crashed-ci", Duration::from_secs(300))
            .await
            .expect("foreign lease");

        let removed = orchestrator
            .force_unlock("operator", "ci runner died")
            .await
            .expect("force unlock");
        assert_eq!(removed.map(|l| l.holder_id), Some(String::from("crashed-ci")));

        let audit = orchestrator.audit().await.expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].actor, "operator");
        assert!(audit[0].detail.contains("ci runner died"));

        let report = orchestrator.apply().await.expect("apply");
        assert_eq!(report.outcome, RunOutcome::Success);
    }

    #[tokio::test]
    async fn test_plan_does_not_touch_state_or_provider() {
        let harness = Harness::new(SimulatedProvider::new());
        let orchestrator = harness.orchestrator(chain());

        let plan = orchestrator.plan().await.expect("plan");

        assert_eq!(plan.count(Action::Create), 4);
        assert_eq!(plan.levels.len(), 4);
        assert!(harness.store.load("dev").await.expect("load").is_none());
        assert!(harness.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_plan_lists_orphans_that_destroy_removes() {
        let harness = Harness::new(SimulatedProvider::new());
        harness.orchestrator(chain()).apply().await.expect("apply");

        let trimmed = harness.orchestrator(chain().into_iter().take(2).collect());
        let plan = trimmed.plan().await.expect("plan");
        let orphans: Vec<&str> = plan.orphans.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(orphans, vec!["lb", "tg"]);

        let report = trimmed.apply().await.expect("apply");
        assert!(report.is_noop());

        let report = trimmed.destroy().await.expect("destroy");
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(order(&report, Action::Delete), vec!["tg", "lb", "subnet", "vpc"]);
    }

    #[tokio::test]
    async fn test_credential_publish_failure_fails_the_run() {
        let harness = Harness::new(SimulatedProvider::new().with_credentials("iam.user", "ci-team"));
        let mut sink = MockCredentialSink::new();
        sink.expect_publish().returning(|recipient, _| {
            Err(CredentialError::PublishFailed {
                recipient: recipient.to_string(),
                message: String::from("vault sealed"),
            })
        });
        let orchestrator = harness
            .orchestrator(vec![ResourceSpec::new("deployer", "iam.user")])
            .with_credential_sink(Some(Arc::new(sink)));

        let report = orchestrator.apply().await.expect("apply");

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.exit_code(), 1);
        let state = orchestrator.state().await.expect("load").expect("state");
        assert_eq!(state.status_of("deployer"), Some(ResourceStatus::Active));
    }

    #[tokio::test]
    async fn test_import_rejects_type_mismatch_and_adopts_resource() {
        let harness = Harness::new(SimulatedProvider::new());
        let existing = harness
            .provider
            .create(&crate::provider::ResourceRequest::new(
                "legacy",
                "vpc",
                "network.vpc",
                crate::config::Attributes::new(),
            ))
            .await
            .expect("external create");
        let orchestrator = harness.orchestrator(chain());

        let err = orchestrator
            .import("vpc", "network.subnet", &existing.provider_id)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), EXIT_INVALID_SPEC);

        let report = orchestrator
            .import("vpc", "network.vpc", &existing.provider_id)
            .await
            .expect("import");
        assert_eq!(report.outcome, RunOutcome::Success);

        let apply = orchestrator.apply().await.expect("apply");
        assert_eq!(apply.entry("vpc").map(|e| e.action), Some(Action::Update));
        assert_eq!(harness.provider.calls_for("create").len(), 4);
    }

    #[tokio::test]
    async fn test_drift_reports_without_locking() {
        let harness = Harness::new(SimulatedProvider::new());
        let orchestrator = harness.orchestrator(chain());
        orchestrator.apply().await.expect("apply");
        harness.provider.drift("vpc", "cidr", serde_json::json!("10.9.0.0/16"));

        let store: SharedStateStore = harness.store.clone();
        LockManager::new(store)
            .acquire("dev", "someone-else", Duration::from_secs(300))
            .await
            .expect("foreign lease");

        let report = orchestrator.drift().await.expect("drift");
        assert!(report.has_drift());
        assert_eq!(report.drifted().len(), 1);
    }
}
