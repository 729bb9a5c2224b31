//! State management module for Halyard.
//!
//! This module provides persistent, revision-checked storage for environment
//! state, lock leases and the administrative audit trail.

mod local;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{SharedStateStore, StateStore};
pub use types::{
    AuditEntry, EnvironmentState, ResourceRecord, ResourceStatus, RunHistoryEntry, RunOperation,
    STATE_VERSION,
};
