//! Resource graph builder.
//!
//! Turns resource specifications (or recorded state) into a dependency DAG
//! with a topological order, and resolves attribute references against
//! recorded state at dispatch time.

mod builder;
mod reference;

pub use builder::{GraphBuilder, GraphNode, ResourceGraph};
pub use reference::{Reference, referenced_ids, references_in, resolve_references};
