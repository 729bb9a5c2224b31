//! Teardown sequencer (destroy).
//!
//! Walks the graph from the leaves up. A record may move to `Deleting` only
//! once every record depending on it is `Deleted` or was never created.
//! Failures are contained: the failed resource and everything beneath it is
//! reported, and the sweep carries on with unrelated resources.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, ProviderError, Result, RunError, StateError};
use crate::graph::ResourceGraph;
use crate::provider::{Provider, ResourceRequest};
use crate::state::{EnvironmentState, ResourceRecord, ResourceStatus, RunOperation};

use super::context::RunContext;
use super::ledger::StateLedger;
use super::poll::{PollOutcome, poll_until, retry_transient};
use super::report::{Action, EntryOutcome, ReportEntry, ReportRecorder, RunOutcome, RunReport};

/// Deletes an environment's resources in reverse dependency order.
pub struct TeardownSequencer<'a> {
    ctx: &'a RunContext,
    provider: &'a dyn Provider,
    ledger: &'a StateLedger,
}

/// Result of deleting one resource.
enum Deletion {
    Deleted { attempts: u32 },
    Failed { message: String, attempts: u32 },
}

impl<'a> TeardownSequencer<'a> {
    /// Creates a sequencer for one run.
    #[must_use]
    pub const fn new(ctx: &'a RunContext, provider: &'a dyn Provider, ledger: &'a StateLedger) -> Self {
        Self { ctx, provider, ledger }
    }

    /// Deletes every recorded resource that `graph` covers.
    ///
    /// When every record ends `Deleted`, the environment's state is removed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the emptied environment cannot be removed
    /// from the store. Resource-level failures are reported.
    pub async fn destroy(&self, graph: &ResourceGraph) -> Result<RunReport> {
        let recorder = ReportRecorder::new(&self.ctx.run_id, &self.ctx.environment, RunOperation::Destroy);
        info!("Destroying {} resource(s) in '{}'", graph.len(), self.ctx.environment);

        for level in graph.reverse_levels() {
            debug!("Sweeping level of {} resource(s)", level.len());
            stream::iter(&level)
                .map(|id| self.sweep(id, graph, &recorder))
                .buffer_unordered(self.ctx.settings.concurrency)
                .collect::<Vec<()>>()
                .await;
        }

        let state = self.ledger.snapshot().await;
        if state.is_fully_deleted() && self.ledger.is_persisted().await {
            self.ledger.delete_environment().await?;
        }

        let cancelled = self.ctx.cancel.reason();
        let incomplete = [EntryOutcome::Failed, EntryOutcome::Blocked, EntryOutcome::Skipped]
            .into_iter()
            .any(|o| recorder.any(o));
        let outcome = if incomplete {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        };

        info!("Destroy of '{}' finished: {outcome}", self.ctx.environment);
        Ok(recorder.finish(outcome, cancelled))
    }

    async fn sweep(&self, id: &str, graph: &ResourceGraph, recorder: &ReportRecorder) {
        let snapshot = self.ledger.snapshot().await;
        let Some(record) = snapshot.record(id) else {
            return;
        };
        let entry = |action, outcome| ReportEntry::new(id, &record.resource_type, action, outcome);

        match record.status {
            ResourceStatus::Deleted => {
                recorder.record(entry(Action::NoOp, EntryOutcome::Succeeded).with_status(ResourceStatus::Deleted));
                return;
            }
            ResourceStatus::Planned => {
                debug!("{id} was never created; dropping its record");
                if let Err(e) = self.ledger.update(|s| Ok(s.remove_record(id))).await {
                    error!("Could not drop record '{id}': {e}");
                }
                recorder.record(entry(Action::NoOp, EntryOutcome::Succeeded));
                return;
            }
            _ => {}
        }

        let waiting = pending_dependents(&snapshot, graph, id);
        if !waiting.is_empty() {
            warn!("{id} is blocked by {}", waiting.join(", "));
            recorder.record(
                entry(Action::Delete, EntryOutcome::Blocked)
                    .with_status(record.status)
                    .with_error(format!("dependents not deleted: {}", waiting.join(", "))),
            );
            return;
        }

        if self.ctx.is_cancelled() {
            recorder.record(
                entry(Action::Delete, EntryOutcome::Skipped)
                    .with_status(record.status)
                    .with_error("run cancelled"),
            );
            return;
        }

        let seq = recorder.next_seq();
        let started = Utc::now();
        info!("delete {id} ({})", record.resource_type);

        let (outcome, status, error, attempts) = match self.delete(record).await {
            Deletion::Deleted { attempts } => (EntryOutcome::Succeeded, Some(ResourceStatus::Deleted), None, attempts),
            Deletion::Failed { message, attempts } => {
                error!("delete of '{id}' failed: {message}");
                let status = self.ledger.snapshot().await.status_of(id);
                (EntryOutcome::Failed, status, Some(message), attempts)
            }
        };

        let mut done = entry(Action::Delete, outcome).dispatched(seq, started).with_attempts(attempts);
        if let Some(status) = status {
            done = done.with_status(status);
        }
        if let Some(error) = error {
            done = done.with_error(error);
        }
        recorder.record(done);
    }

    /// Deletes one eligible resource and records the result.
    async fn delete(&self, record: &ResourceRecord) -> Deletion {
        let id = record.id.as_str();
        let deadline = Instant::now() + self.ctx.settings.resource_timeout;

        if let Err(e) = self.ledger.update(|s| s.transition(id, ResourceStatus::Deleting)).await {
            return Deletion::Failed {
                message: e.to_string(),
                attempts: 0,
            };
        }

        let result = self.delete_remote(record, deadline).await;
        let deletion = match result {
            Ok(attempts) => Deletion::Deleted { attempts },
            Err((message, attempts)) => Deletion::Failed { message, attempts },
        };

        let settled = match &deletion {
            Deletion::Deleted { .. } => {
                self.ledger
                    .update(|s| {
                        let record = record_mut(s, id)?;
                        record.transition(ResourceStatus::Deleted)?;
                        record.provider_id = None;
                        record.outputs.clear();
                        Ok(())
                    })
                    .await
            }
            Deletion::Failed { message, .. } => {
                self.ledger
                    .update(|s| record_mut(s, id)?.fail(message))
                    .await
            }
        };

        match settled {
            Ok(()) => deletion,
            Err(e) => Deletion::Failed {
                message: format!("could not record result: {e}"),
                attempts: 0,
            },
        }
    }

    /// Provider side of a delete. Returns the number of delete calls made.
    async fn delete_remote(&self, record: &ResourceRecord, deadline: Instant) -> std::result::Result<u32, (String, u32)> {
        let provider = self.provider;
        let settings = &self.ctx.settings;
        let resource_type = record.resource_type.as_str();

        let provider_id = match &record.provider_id {
            Some(pid) => pid.clone(),
            None => {
                // A failed create may still have produced a resource.
                let request =
                    ResourceRequest::new(&self.ctx.environment, &record.id, resource_type, record.attributes.clone());
                let request = &request;
                let found = retry_transient("lookup", &settings.retry, settings.call_timeout, deadline, move || {
                    provider.lookup(request)
                })
                .await;
                match found.result {
                    Ok(Some(resource)) => resource.provider_id,
                    Ok(None) => {
                        debug!("{} was never created at the provider", record.id);
                        return Ok(0);
                    }
                    Err(e) => return Err((e.to_string(), found.attempts)),
                }
            }
        };
        let provider_id = provider_id.as_str();

        if provider.has_attachments(resource_type) {
            let budget = deadline.saturating_duration_since(Instant::now());
            let outcome = poll_until(
                move || async move { provider.attachments(resource_type, provider_id).await.map(|a| a.is_empty()) },
                &settings.attachment_poll,
                budget,
                Some(&self.ctx.cancel),
            )
            .await;

            match outcome {
                Ok(PollOutcome::Ready { .. }) => {}
                Ok(PollOutcome::Exhausted { attempts } | PollOutcome::TimedOut { attempts }) => {
                    let err = RunError::AttachmentTimeout {
                        resource: record.id.clone(),
                        attempts,
                    };
                    return Err((err.to_string(), 0));
                }
                Ok(PollOutcome::Cancelled { .. }) => {
                    return Err((String::from("cancelled while waiting for attachments to detach"), 0));
                }
                Err(e) if e.class() == ErrorClass::NotFound => {
                    info!("{} is already gone", record.id);
                    return Ok(0);
                }
                Err(e) => return Err((e.to_string(), 0)),
            }
        }

        let attempted = retry_transient("delete", &settings.retry, settings.call_timeout, deadline, move || {
            provider.delete(resource_type, provider_id)
        })
        .await;

        match attempted.result {
            Ok(()) => Ok(attempted.attempts),
            Err(ProviderError::NotFound { .. }) => {
                info!("{} was already deleted at the provider", record.id);
                Ok(attempted.attempts)
            }
            Err(e) => Err((e.to_string(), attempted.attempts)),
        }
    }
}

fn record_mut<'s>(state: &'s mut EnvironmentState, id: &str) -> std::result::Result<&'s mut ResourceRecord, StateError> {
    state.record_mut(id).ok_or_else(|| StateError::RecordNotFound {
        resource: id.to_string(),
    })
}

/// Dependents of `id` that still exist.
fn pending_dependents(state: &EnvironmentState, graph: &ResourceGraph, id: &str) -> Vec<String> {
    graph
        .dependents_of(id)
        .into_iter()
        .flatten()
        .filter(|dependent| {
            state
                .status_of(dependent)
                .is_some_and(|status| status != ResourceStatus::Deleted)
        })
        .cloned()
        .collect()
}
