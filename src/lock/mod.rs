//! Lock manager for environment scopes.
//!
//! A lease-based distributed mutex built on the state store's conditional
//! writes. Exactly one live lease may exist per environment.

mod lease;
mod manager;

pub use lease::{LeaseCondition, LockLease, generate_holder_id};
pub use manager::{FORCE_RELEASE_ACTION, HeartbeatHandle, LockManager};
