//! Process-wide registry of graph definitions.
//!
//! Graphs are content-addressed by `(name, version)`. Re-registering the
//! same identity with an identical structure is idempotent; re-registering
//! with a different structure fails with [`RegistryError::GraphMismatch`].
//! The registry is write-once per identity and therefore effectively
//! immutable after registration, which is what lets executions hold a
//! `GraphRef` rather than the graph itself.

use std::sync::{Arc, RwLock};

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::types::GraphRef;

use super::Graph;

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("graph {graph_ref} already registered with a different definition")]
    #[diagnostic(
        code(trellis::registry::graph_mismatch),
        help("Bump the graph version instead of redefining an existing one.")
    )]
    GraphMismatch { graph_ref: GraphRef },

    #[error("unknown graph: {graph_ref}")]
    #[diagnostic(code(trellis::registry::unknown_graph))]
    UnknownGraph { graph_ref: GraphRef },
}

/// Mapping from `(name, version)` to immutable graph definitions.
#[derive(Debug, Default)]
pub struct GraphRegistry {
    inner: RwLock<FxHashMap<GraphRef, Arc<Graph>>>,
}

impl GraphRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validated graph, returning the shared handle.
    ///
    /// Idempotent for structurally identical re-registrations.
    pub fn register(&self, graph: Graph) -> Result<Arc<Graph>, RegistryError> {
        let graph_ref = graph.graph_ref();
        let mut guard = self.inner.write().expect("registry lock poisoned");
        if let Some(existing) = guard.get(&graph_ref) {
            if existing.fingerprint() == graph.fingerprint() {
                return Ok(existing.clone());
            }
            return Err(RegistryError::GraphMismatch { graph_ref });
        }
        let shared = Arc::new(graph);
        guard.insert(graph_ref, shared.clone());
        Ok(shared)
    }

    pub fn lookup(&self, graph_ref: &GraphRef) -> Result<Arc<Graph>, RegistryError> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(graph_ref)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownGraph {
                graph_ref: graph_ref.clone(),
            })
    }

    #[must_use]
    pub fn contains(&self, graph_ref: &GraphRef) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .contains_key(graph_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphs::{Graph, Predicate};
    use crate::node::{node_fn, NodeOutput};
    use serde_json::json;

    fn sample(version: &str, dep: &str) -> Graph {
        Graph::builder("g", version)
            .input(dep)
            .compute(
                "out",
                Predicate::provided(dep),
                node_fn(|_| async { Ok(NodeOutput::Value(json!(1))) }),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn register_then_lookup() {
        let registry = GraphRegistry::new();
        let graph_ref = sample("v1", "a").graph_ref();
        registry.register(sample("v1", "a")).unwrap();
        assert!(registry.lookup(&graph_ref).is_ok());
        assert!(registry
            .lookup(&GraphRef::new("g", "v9"))
            .is_err());
    }

    #[test]
    fn identical_re_registration_is_idempotent() {
        let registry = GraphRegistry::new();
        registry.register(sample("v1", "a")).unwrap();
        registry.register(sample("v1", "a")).unwrap();
    }

    #[test]
    fn structural_mismatch_rejected() {
        let registry = GraphRegistry::new();
        registry.register(sample("v1", "a")).unwrap();
        let err = registry.register(sample("v1", "b")).unwrap_err();
        assert!(matches!(err, RegistryError::GraphMismatch { .. }));
    }
}
