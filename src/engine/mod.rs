//! Run engines.
//!
//! The convergence engine (apply), the teardown sequencer (destroy), the
//! drift detector and import all share the same plumbing: a [`RunContext`],
//! a [`StateLedger`] that persists every status change as it happens, the
//! retry and polling helpers, and a [`RunReport`] as output.

mod context;
mod converge;
mod drift;
mod import;
mod ledger;
mod poll;
mod report;
mod teardown;

pub use context::{CancelSignal, EngineSettings, RunContext};
pub use converge::ConvergenceEngine;
pub use drift::{AttributeDrift, DriftDetector, DriftKind, DriftReport, ResourceDrift};
pub use import::{ImportRequest, import_resource};
pub use ledger::StateLedger;
pub use poll::{Attempted, BackoffPolicy, PollOutcome, PollPolicy, RetryPolicy, poll_until, retry_transient};
pub use report::{Action, EntryOutcome, ReportEntry, ReportRecorder, ReportSummary, RunOutcome, RunReport};
pub use teardown::TeardownSequencer;
