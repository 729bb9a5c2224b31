//! Run context and cancellation.
//!
//! Everything a run needs to know about itself (environment, holder, run id,
//! tuning) travels in a [`RunContext`] handed to every engine. Nothing is
//! read from ambient process state once a run has started.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::EngineConfig;

use super::poll::{BackoffPolicy, PollPolicy, RetryPolicy};

/// Cooperative cancellation flag shared between a run and its helpers.
///
/// The first reason given wins; later calls are ignored.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Creates a signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation.
    pub fn cancel(&self, reason: &str) {
        let changed = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        });
        if changed {
            warn!("Run cancelled: {reason}");
        }
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Why the run was cancelled, if it was.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(Option::is_some).await;
    }
}

/// Engine tuning derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum concurrent operations per dependency level.
    pub concurrency: usize,
    /// Transient retry policy for provider calls.
    pub retry: RetryPolicy,
    /// Timeout of a single provider call.
    pub call_timeout: Duration,
    /// Budget of a single resource, retries and polling included.
    pub resource_timeout: Duration,
    /// Budget of the whole run.
    pub run_timeout: Duration,
    /// Attachment polling before deletes.
    pub attachment_poll: PollPolicy,
    /// Readiness polling after creates and updates.
    pub readiness_poll: PollPolicy,
}

impl EngineSettings {
    /// Builds settings from the engine section of the configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let backoff = BackoffPolicy::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.backoff_multiplier,
        );
        Self {
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                backoff,
            },
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            resource_timeout: Duration::from_secs(config.resource_timeout_secs),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            attachment_poll: PollPolicy {
                attempts: config.attachment_poll_attempts.max(1),
                backoff: BackoffPolicy::new(
                    Duration::from_millis(config.attachment_poll_interval_ms),
                    Duration::from_millis(config.max_backoff_ms),
                    config.backoff_multiplier,
                ),
            },
            readiness_poll: PollPolicy {
                attempts: config.readiness_poll_attempts.max(1),
                backoff: BackoffPolicy::constant(Duration::from_millis(config.readiness_poll_interval_ms)),
            },
        }
    }

    /// Fast settings for tests and the simulated provider.
    #[must_use]
    pub fn fast() -> Self {
        let backoff = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 2.0);
        Self {
            concurrency: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: backoff.clone(),
            },
            call_timeout: Duration::from_secs(5),
            resource_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(60),
            attachment_poll: PollPolicy {
                attempts: 3,
                backoff: backoff.clone(),
            },
            readiness_poll: PollPolicy { attempts: 5, backoff },
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Identity and tuning of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Environment scope.
    pub environment: String,
    /// Lock holder identity.
    pub holder_id: String,
    /// Unique id of this run.
    pub run_id: String,
    /// Engine tuning.
    pub settings: EngineSettings,
    /// Cancellation shared with the heartbeat and timeout tasks.
    pub cancel: CancelSignal,
}

impl RunContext {
    /// Creates a context with a fresh run id.
    #[must_use]
    pub fn new(environment: &str, holder_id: &str, settings: EngineSettings) -> Self {
        Self {
            environment: environment.to_string(),
            holder_id: holder_id.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            settings,
            cancel: CancelSignal::new(),
        }
    }

    /// Whether the run should stop dispatching new work.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Starts a timer that cancels the run once its budget is spent.
    ///
    /// Abort the returned handle when the run completes.
    #[must_use]
    pub fn arm_run_timeout(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let budget = self.settings.run_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            cancel.cancel(&format!("run exceeded its {}s budget", budget.as_secs()));
        })
    }
}
