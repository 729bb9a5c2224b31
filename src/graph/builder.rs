//! Dependency graph construction and topological ordering.
//!
//! Edges run from a dependent to its dependency. They come from explicit
//! `depends_on` lists and from `${id}` references inside attributes. The
//! topological sort is a depth-first search that reports the offending path
//! on the first back edge, before anything is touched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::config::ResourceSpec;
use crate::error::GraphError;
use crate::state::EnvironmentState;

use super::reference::referenced_ids;

/// A node of the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// Resource id.
    pub id: String,
    /// Resource type.
    pub resource_type: String,
    /// Ids this node depends on.
    pub dependencies: BTreeSet<String>,
    /// Ids that depend on this node.
    pub dependents: BTreeSet<String>,
    /// Longest path to a node without dependencies.
    pub depth: usize,
    /// Longest path to a node without dependents.
    pub height: usize,
}

/// A validated dependency DAG with its topological order.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: HashMap<String, GraphNode>,
    order: Vec<String>,
}

/// Builder for [`ResourceGraph`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphBuilder;

/// Input node before sorting.
struct PendingNode {
    id: String,
    resource_type: String,
    dependencies: BTreeSet<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl GraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph of a desired resource set.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate ids, references to unknown ids, or cycles.
    pub fn build(&self, specs: &[ResourceSpec]) -> Result<ResourceGraph, GraphError> {
        let pending = specs
            .iter()
            .map(|spec| PendingNode {
                id: spec.id.clone(),
                resource_type: spec.resource_type.clone(),
                dependencies: Self::spec_dependencies(spec),
            })
            .collect();

        Self::assemble(pending, true)
    }

    /// Builds the teardown graph from recorded state, optionally merged with
    /// a fresh desired resource set.
    ///
    /// Every record becomes a node. Edges are the union of the recorded
    /// dependencies and, for records present in `specs`, the desired ones.
    /// Dependencies on ids without a record are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged edges form a cycle.
    pub fn from_records(
        &self,
        state: &EnvironmentState,
        specs: Option<&[ResourceSpec]>,
    ) -> Result<ResourceGraph, GraphError> {
        let desired: HashMap<&str, &ResourceSpec> = specs
            .unwrap_or_default()
            .iter()
            .map(|s| (s.id.as_str(), s))
            .collect();

        let pending = state
            .records
            .values()
            .map(|record| {
                let mut dependencies = record.dependency_ids.clone();
                if let Some(spec) = desired.get(record.id.as_str()) {
                    dependencies.extend(Self::spec_dependencies(spec));
                }
                dependencies.retain(|dep| {
                    let known = state.records.contains_key(dep);
                    if !known {
                        warn!("Record '{}' depends on '{dep}' which has no record; ignoring", record.id);
                    }
                    known
                });
                PendingNode {
                    id: record.id.clone(),
                    resource_type: record.resource_type.clone(),
                    dependencies,
                }
            })
            .collect();

        Self::assemble(pending, false)
    }

    /// Explicit plus inferred dependencies of a spec.
    #[must_use]
    pub fn spec_dependencies(spec: &ResourceSpec) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = spec.depends_on.iter().cloned().collect();
        deps.extend(referenced_ids(&spec.attributes));
        deps
    }

    fn assemble(pending: Vec<PendingNode>, strict: bool) -> Result<ResourceGraph, GraphError> {
        let mut declared: Vec<String> = Vec::with_capacity(pending.len());
        let mut nodes: HashMap<String, GraphNode> = HashMap::with_capacity(pending.len());

        for node in pending {
            if nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode { id: node.id });
            }
            declared.push(node.id.clone());
            nodes.insert(
                node.id.clone(),
                GraphNode {
                    id: node.id,
                    resource_type: node.resource_type,
                    dependencies: node.dependencies,
                    dependents: BTreeSet::new(),
                    depth: 0,
                    height: 0,
                },
            );
        }

        if strict {
            for id in &declared {
                if let Some(missing) = nodes[id].dependencies.iter().find(|d| !nodes.contains_key(*d)) {
                    return Err(GraphError::UnknownDependency {
                        resource: id.clone(),
                        dependency: missing.clone(),
                    });
                }
            }
        }

        let order = topological_order(&declared, &nodes)?;

        let edges: Vec<(String, String)> = nodes
            .values()
            .flat_map(|n| n.dependencies.iter().map(|d| (n.id.clone(), d.clone())))
            .collect();
        for (dependent, dependency) in edges {
            if let Some(node) = nodes.get_mut(&dependency) {
                node.dependents.insert(dependent);
            }
        }

        for id in &order {
            let depth = nodes[id]
                .dependencies
                .iter()
                .filter_map(|d| nodes.get(d))
                .map(|n| n.depth + 1)
                .max()
                .unwrap_or(0);
            if let Some(node) = nodes.get_mut(id) {
                node.depth = depth;
            }
        }
        for id in order.iter().rev() {
            let height = nodes[id]
                .dependents
                .iter()
                .filter_map(|d| nodes.get(d))
                .map(|n| n.height + 1)
                .max()
                .unwrap_or(0);
            if let Some(node) = nodes.get_mut(id) {
                node.height = height;
            }
        }

        debug!("Built dependency graph with {} nodes", order.len());
        Ok(ResourceGraph { nodes, order })
    }
}

/// Depth-first topological sort, dependencies first.
///
/// Roots are visited in declaration order and dependencies in id order, so
/// the result is deterministic.
fn topological_order(declared: &[String], nodes: &HashMap<String, GraphNode>) -> Result<Vec<String>, GraphError> {
    fn visit(
        id: &str,
        nodes: &HashMap<String, GraphNode>,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| s == id).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].to_vec();
                path.push(id.to_string());
                return Err(GraphError::CyclicDependency { path });
            }
            None => {}
        }

        marks.insert(id.to_string(), Mark::Visiting);
        stack.push(id.to_string());

        if let Some(node) = nodes.get(id) {
            for dep in &node.dependencies {
                if nodes.contains_key(dep) {
                    visit(dep, nodes, marks, stack, order)?;
                }
            }
        }

        stack.pop();
        marks.insert(id.to_string(), Mark::Done);
        order.push(id.to_string());
        Ok(())
    }

    let mut marks = HashMap::with_capacity(nodes.len());
    let mut stack = Vec::new();
    let mut order = Vec::with_capacity(nodes.len());
    for id in declared {
        visit(id, nodes, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

impl ResourceGraph {
    /// Ids in topological order, dependencies first.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Ids in reverse topological order, dependents first.
    #[must_use]
    pub fn reverse_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Ids grouped by depth, ascending. Nodes within a level share no edge.
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<String>> {
        self.group_by(|n| n.depth, &self.order)
    }

    /// Ids grouped by height, ascending: nodes without dependents first.
    #[must_use]
    pub fn reverse_levels(&self) -> Vec<Vec<String>> {
        self.group_by(|n| n.height, &self.reverse_order())
    }

    fn group_by(&self, key: impl Fn(&GraphNode) -> usize, order: &[String]) -> Vec<Vec<String>> {
        let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for id in order {
            if let Some(node) = self.nodes.get(id) {
                levels.entry(key(node)).or_default().push(id.clone());
            }
        }
        levels.into_values().collect()
    }

    /// Gets a node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    /// Ids a node depends on.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.nodes.get(id).map(|n| &n.dependencies)
    }

    /// Ids that depend on a node.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.nodes.get(id).map(|n| &n.dependents)
    }

    /// All `(dependent, dependency)` edges.
    #[must_use]
    pub fn edges(&self) -> Vec<(String, String)> {
        self.order
            .iter()
            .flat_map(|id| {
                self.nodes[id]
                    .dependencies
                    .iter()
                    .map(move |d| (id.clone(), d.clone()))
            })
            .collect()
    }

    /// Returns true if the graph has this node.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
