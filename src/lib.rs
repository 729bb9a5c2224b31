// ============================================================================
// Linting
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::cognitive_complexity)]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halyard
//!
//! A dependency-aware convergence and teardown engine for cloud environments.
//!
//! ## Overview
//!
//! Halyard takes a declared set of resources, works out the order they
//! depend on each other in, and drives a provider until the environment
//! matches the declaration:
//!
//! - `apply` creates and updates resources in dependency order, and running
//!   it twice in a row is a no-op
//! - `destroy` deletes them in reverse order, waits for attachments to let
//!   go, and keeps going past individual failures
//! - `drift` compares what was recorded with what the provider reports
//! - `import` adopts a resource created elsewhere
//!
//! Every mutating run holds a lease-based lock over its environment, kept
//! alive by a heartbeat and reclaimable once stale.
//!
//! ## Modules
//!
//! - [`config`]: Desired-state file parsing, validation and hashing
//! - [`state`]: State store backends (local, in-memory, S3)
//! - [`lock`]: Environment leases
//! - [`graph`]: Dependency graph and reference resolution
//! - [`planner`]: Diff and execution plan
//! - [`engine`]: Convergence, teardown, drift detection and import
//! - [`provider`]: Provider capability interface and implementations
//! - [`credentials`]: Credential hand-off
//! - [`orchestrator`]: Run coordination
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! environment:
//!   name: staging
//!
//! provider:
//!   endpoint: https://provider.internal/
//!
//! resources:
//!   - id: vpc
//!     type: network.vpc
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - id: subnet
//!     type: network.subnet
//!     attributes:
//!       vpc_id: ${vpc}
//!       cidr: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lock;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig, ResourceSpec};
pub use engine::{DriftReport, RunOutcome, RunReport};
pub use error::{HalyardError, Result};
pub use orchestrator::Orchestrator;
pub use planner::{DiffEngine, ExecutionPlan};
pub use state::{EnvironmentState, LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
