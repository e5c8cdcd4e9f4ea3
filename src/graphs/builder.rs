//! GraphBuilder: fluent construction and validation of dataflow graphs.
//!
//! The builder accumulates node definitions and validates the whole graph
//! at [`build`](GraphBuilder::build): unique names, dependencies that
//! exist, no self-dependencies, no cycles, and well-formed mutate targets.
//! A graph that fails validation is never constructed, so everything
//! downstream (registry, store, scheduler) can trust graph structure.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::node::NodeFn;
use crate::types::{is_system_node, NodeKind};

use super::{system_node_defs, Graph, NodeDef, Predicate};

/// Errors detected while validating a graph definition.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphValidationError {
    #[error("duplicate node name: {name}")]
    #[diagnostic(code(trellis::graphs::duplicate_node))]
    DuplicateNode { name: String },

    #[error("node name {name} is reserved for system use")]
    #[diagnostic(
        code(trellis::graphs::reserved_name),
        help("execution_id and last_updated_at are added to every graph automatically.")
    )]
    ReservedName { name: String },

    #[error("node {node} depends on unknown node {dependency}")]
    #[diagnostic(code(trellis::graphs::unknown_dependency))]
    UnknownDependency { node: String, dependency: String },

    #[error("node {node} depends on itself")]
    #[diagnostic(code(trellis::graphs::self_dependency))]
    SelfDependency { node: String },

    #[error("dependency cycle through {node}")]
    #[diagnostic(
        code(trellis::graphs::cycle),
        help("Upstream predicates must form a DAG.")
    )]
    Cycle { node: String },

    #[error("mutate node {node} targets unknown node {target}")]
    #[diagnostic(code(trellis::graphs::mutate_target_missing))]
    MutateTargetMissing { node: String, target: String },

    #[error("mutate node {node} targets input node {target}")]
    #[diagnostic(
        code(trellis::graphs::mutate_target_input),
        help("Input values are written by callers via set; point the mutation at a derived node.")
    )]
    MutateTargetIsInput { node: String, target: String },

    #[error("graph has no nodes")]
    #[diagnostic(code(trellis::graphs::empty))]
    Empty,
}

/// Fluent builder for [`Graph`] definitions.
///
/// Per-node tuning methods ([`timeout`](Self::timeout),
/// [`max_attempts`](Self::max_attempts)) apply to the most recently added
/// node.
///
/// # Examples
///
/// ```rust
/// use trellis::graphs::{Graph, Predicate};
/// use trellis::node::{node_fn, NodeOutput};
/// use serde_json::json;
///
/// let graph = Graph::builder("greetings", "v1")
///     .input("user_name")
///     .compute(
///         "greeting",
///         Predicate::provided("user_name"),
///         node_fn(|inputs| async move {
///             let name = inputs.require_str("user_name")?.to_string();
///             Ok(NodeOutput::Value(json!(format!("Hello, {name}"))))
///         }),
///     )
///     .build()
///     .unwrap();
/// assert_eq!(graph.nodes().len(), 4); // two user nodes + two system nodes
/// ```
pub struct GraphBuilder {
    name: String,
    version: String,
    nodes: Vec<NodeDef>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            nodes: Vec::new(),
        }
    }

    /// Add an input node. Its value is written by callers via `set`.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.nodes.push(NodeDef {
            name: name.into(),
            kind: NodeKind::Input,
            when: None,
            func: None,
            mutates: None,
            attempt_timeout: None,
            max_attempts: None,
        });
        self
    }

    /// Add a compute node gated on `when`.
    #[must_use]
    pub fn compute(self, name: impl Into<String>, when: Predicate, func: Arc<dyn NodeFn>) -> Self {
        self.derived(name, NodeKind::Compute, when, func, None)
    }

    /// Add a schedule node that fires once.
    #[must_use]
    pub fn schedule_once(
        self,
        name: impl Into<String>,
        when: Predicate,
        func: Arc<dyn NodeFn>,
    ) -> Self {
        self.derived(name, NodeKind::ScheduleOnce, when, func, None)
    }

    /// Add a schedule node that re-fires after dependants consume each
    /// fire time.
    #[must_use]
    pub fn schedule_recurring(
        self,
        name: impl Into<String>,
        when: Predicate,
        func: Arc<dyn NodeFn>,
    ) -> Self {
        self.derived(name, NodeKind::ScheduleRecurring, when, func, None)
    }

    /// Add a mutate node whose successful value is written to `target`.
    #[must_use]
    pub fn mutate(
        self,
        name: impl Into<String>,
        when: Predicate,
        target: impl Into<String>,
        func: Arc<dyn NodeFn>,
    ) -> Self {
        self.derived(name, NodeKind::Mutate, when, func, Some(target.into()))
    }

    fn derived(
        mut self,
        name: impl Into<String>,
        kind: NodeKind,
        when: Predicate,
        func: Arc<dyn NodeFn>,
        mutates: Option<String>,
    ) -> Self {
        self.nodes.push(NodeDef {
            name: name.into(),
            kind,
            when: Some(when),
            func: Some(func),
            mutates,
            attempt_timeout: None,
            max_attempts: None,
        });
        self
    }

    /// Override the attempt timeout for the most recently added node.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.attempt_timeout = Some(timeout);
        }
        self
    }

    /// Override the retry budget for the most recently added node.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.max_attempts = Some(attempts);
        }
        self
    }

    /// Validate and construct the immutable [`Graph`].
    pub fn build(self) -> Result<Graph, GraphValidationError> {
        if self.nodes.is_empty() {
            return Err(GraphValidationError::Empty);
        }

        let mut nodes = self.nodes;
        for def in system_node_defs() {
            if nodes.iter().any(|n| n.name == def.name) {
                return Err(GraphValidationError::ReservedName { name: def.name });
            }
            nodes.push(def);
        }

        let mut seen: FxHashMap<&str, ()> = FxHashMap::default();
        for node in &nodes {
            if seen.insert(node.name.as_str(), ()).is_some() {
                return Err(GraphValidationError::DuplicateNode {
                    name: node.name.clone(),
                });
            }
        }

        for node in &nodes {
            if is_system_node(&node.name) && node.when.is_some() {
                return Err(GraphValidationError::ReservedName {
                    name: node.name.clone(),
                });
            }
            for dep in node.upstreams() {
                if dep == node.name {
                    return Err(GraphValidationError::SelfDependency {
                        node: node.name.clone(),
                    });
                }
                if !seen.contains_key(dep.as_str()) {
                    return Err(GraphValidationError::UnknownDependency {
                        node: node.name.clone(),
                        dependency: dep,
                    });
                }
            }
            if let Some(target) = &node.mutates {
                let Some(target_def) = nodes.iter().find(|n| &n.name == target) else {
                    return Err(GraphValidationError::MutateTargetMissing {
                        node: node.name.clone(),
                        target: target.clone(),
                    });
                };
                if target_def.kind.is_input() {
                    return Err(GraphValidationError::MutateTargetIsInput {
                        node: node.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        detect_cycles(&nodes)?;

        Ok(Graph::from_validated(self.name, self.version, nodes))
    }
}

/// Depth-first cycle detection over the upstream-predicate edges.
fn detect_cycles(nodes: &[NodeDef]) -> Result<(), GraphValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: FxHashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; nodes.len()];

    fn visit(
        i: usize,
        nodes: &[NodeDef],
        index: &FxHashMap<&str, usize>,
        marks: &mut [Mark],
    ) -> Result<(), GraphValidationError> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                return Err(GraphValidationError::Cycle {
                    node: nodes[i].name.clone(),
                })
            }
            Mark::Unvisited => {}
        }
        marks[i] = Mark::InProgress;
        for dep in nodes[i].upstreams() {
            if let Some(&j) = index.get(dep.as_str()) {
                visit(j, nodes, index, marks)?;
            }
        }
        marks[i] = Mark::Done;
        Ok(())
    }

    for i in 0..nodes.len() {
        visit(i, nodes, &index, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{node_fn, NodeOutput};
    use serde_json::json;

    fn noop() -> Arc<dyn NodeFn> {
        node_fn(|_| async { Ok(NodeOutput::Value(json!(null))) })
    }

    #[test]
    fn valid_graph_gains_system_nodes() {
        let graph = Graph::builder("g", "v1")
            .input("a")
            .compute("b", Predicate::provided("a"), noop())
            .build()
            .unwrap();
        assert!(graph.node("execution_id").is_some());
        assert!(graph.node("last_updated_at").is_some());
        assert_eq!(graph.computable_nodes().count(), 1);
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = Graph::builder("g", "v1")
            .input("a")
            .input("a")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphValidationError::DuplicateNode { .. }));
    }

    #[test]
    fn reserved_names_rejected() {
        let err = Graph::builder("g", "v1")
            .input("execution_id")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphValidationError::ReservedName { .. }));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = Graph::builder("g", "v1")
            .compute("b", Predicate::provided("missing"), noop())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            GraphValidationError::UnknownDependency { .. }
        ));
    }

    #[test]
    fn self_dependency_rejected() {
        let err = Graph::builder("g", "v1")
            .compute("b", Predicate::provided("b"), noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphValidationError::SelfDependency { .. }));
    }

    #[test]
    fn cycles_rejected() {
        let err = Graph::builder("g", "v1")
            .compute("a", Predicate::provided("b"), noop())
            .compute("b", Predicate::provided("a"), noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphValidationError::Cycle { .. }));
    }

    #[test]
    fn mutate_target_rules() {
        let err = Graph::builder("g", "v1")
            .input("a")
            .mutate("m", Predicate::provided("a"), "missing", noop())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            GraphValidationError::MutateTargetMissing { .. }
        ));

        let err = Graph::builder("g", "v1")
            .input("a")
            .mutate("m", Predicate::provided("a"), "a", noop())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            GraphValidationError::MutateTargetIsInput { .. }
        ));

        let graph = Graph::builder("g", "v1")
            .input("a")
            .compute("b", Predicate::provided("a"), noop())
            .mutate("m", Predicate::provided("b"), "b", noop())
            .build()
            .unwrap();
        assert_eq!(graph.node("m").unwrap().write_target(), "b");
    }

    #[test]
    fn per_node_overrides_attach_to_last_node() {
        let graph = Graph::builder("g", "v1")
            .input("a")
            .compute("b", Predicate::provided("a"), noop())
            .timeout(Duration::from_secs(5))
            .max_attempts(7)
            .build()
            .unwrap();
        let b = graph.node("b").unwrap();
        assert_eq!(b.attempt_timeout, Some(Duration::from_secs(5)));
        assert_eq!(b.max_attempts, Some(7));
        assert!(graph.node("a").unwrap().attempt_timeout.is_none());
    }
}
