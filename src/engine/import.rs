//! Import of externally created resources.

use chrono::Utc;
use tokio::time::Instant;
use tracing::info;

use crate::config::{ConfigHasher, ResourceSpec};
use crate::error::{ProviderError, Result, RunError};
use crate::graph::GraphBuilder;
use crate::provider::Provider;
use crate::state::{ResourceRecord, ResourceStatus, RunOperation};

use super::context::RunContext;
use super::ledger::StateLedger;
use super::poll::retry_transient;
use super::report::{Action, EntryOutcome, ReportEntry, ReportRecorder, RunOutcome, RunReport};

/// What to import.
#[derive(Debug, Clone)]
pub struct ImportRequest<'a> {
    /// Logical id to record the resource under.
    pub id: &'a str,
    /// Resource type.
    pub resource_type: &'a str,
    /// Provider identifier of the existing resource.
    pub provider_id: &'a str,
    /// Desired spec for the id, if the configuration declares one.
    pub spec: Option<&'a ResourceSpec>,
}

/// Attaches an existing resource to a record without creating it.
///
/// The record stores the live attributes, so a later apply converges the
/// resource toward its declared spec with an in-place update.
///
/// # Errors
///
/// Returns [`RunError::AlreadyManaged`] if the id is active or mid-operation,
/// a provider error if the resource cannot be read or has another type, or
/// a store error.
pub async fn import_resource(
    ctx: &RunContext,
    provider: &dyn Provider,
    ledger: &StateLedger,
    request: &ImportRequest<'_>,
) -> Result<RunReport> {
    let ImportRequest {
        id,
        resource_type,
        provider_id,
        spec,
    } = *request;

    if let Some(status) = ledger.snapshot().await.status_of(id) {
        if status == ResourceStatus::Active || status.is_transitional() {
            return Err(RunError::AlreadyManaged {
                resource: id.to_string(),
                status: status.to_string(),
            }
            .into());
        }
    }

    let recorder = ReportRecorder::new(&ctx.run_id, &ctx.environment, RunOperation::Import);
    let seq = recorder.next_seq();
    let started = Utc::now();
    let deadline = Instant::now() + ctx.settings.resource_timeout;

    let read = retry_transient("read", &ctx.settings.retry, ctx.settings.call_timeout, deadline, move || {
        provider.read(resource_type, provider_id)
    })
    .await;
    let live = read.result?;
    if live.resource_type != resource_type {
        return Err(ProviderError::invalid_spec(format!(
            "{provider_id} is a {}, not a {resource_type}",
            live.resource_type
        ))
        .into());
    }

    let dependencies = spec.map(GraphBuilder::spec_dependencies).unwrap_or_default();
    let mut observed = ResourceSpec::new(id, resource_type);
    observed.attributes = live.attributes.clone();
    observed.depends_on = dependencies.iter().cloned().collect();
    let hash = ConfigHasher::new().hash_resource(&observed);

    let record = ResourceRecord::imported(
        id,
        resource_type,
        provider_id,
        live.attributes.clone(),
        &hash,
        live.attributes,
        dependencies,
    );
    ledger
        .update(|state| {
            state.set_record(record);
            Ok(())
        })
        .await?;

    info!("Imported {provider_id} as '{id}' ({resource_type})");
    recorder.record(
        ReportEntry::new(id, resource_type, Action::Import, EntryOutcome::Succeeded)
            .dispatched(seq, started)
            .with_status(ResourceStatus::Active)
            .with_attempts(read.attempts),
    );
    Ok(recorder.finish(RunOutcome::Success, None))
}
