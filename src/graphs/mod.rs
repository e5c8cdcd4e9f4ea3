//! Graph model: node definitions, the predicate language, validation,
//! registration, and the mermaid renderer.
//!
//! A [`Graph`] is an immutable, validated declaration of nodes and their
//! upstream predicates, identified by `(name, version)`. Construction goes
//! through [`GraphBuilder`], which validates on `build`; registration goes
//! through [`GraphRegistry`], which enforces that an identity is never
//! redefined with a different structure.

pub mod builder;
pub mod mermaid;
pub mod predicate;
pub mod registry;

pub use builder::{GraphBuilder, GraphValidationError};
pub use mermaid::generate_mermaid_graph;
pub use predicate::{Predicate, ValueLookup};
pub use registry::{GraphRegistry, RegistryError};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHasher};

use crate::node::NodeFn;
use crate::types::{GraphRef, NodeKind, EXECUTION_ID_NODE, LAST_UPDATED_AT_NODE};

/// One named slot in a graph.
///
/// The kind determines how the node's value is produced; `when` gates
/// computation on upstream state. Inputs and system nodes carry neither a
/// predicate nor a function.
#[derive(Clone)]
pub struct NodeDef {
    pub name: String,
    pub kind: NodeKind,
    /// Upstream predicate; `None` only for input nodes.
    pub when: Option<Predicate>,
    /// User function; `None` only for input nodes.
    pub func: Option<Arc<dyn NodeFn>>,
    /// Target node name, for `Mutate` nodes.
    pub mutates: Option<String>,
    /// Per-node override of the engine's default attempt timeout.
    pub attempt_timeout: Option<Duration>,
    /// Per-node override of the engine's default retry budget.
    pub max_attempts: Option<u32>,
}

impl NodeDef {
    /// The direct upstream dependencies, in predicate mention order.
    #[must_use]
    pub fn upstreams(&self) -> Vec<String> {
        self.when
            .as_ref()
            .map(Predicate::upstreams)
            .unwrap_or_default()
    }

    /// Which node instance receives this node's successful value.
    #[must_use]
    pub fn write_target(&self) -> &str {
        self.mutates.as_deref().unwrap_or(&self.name)
    }

    /// Structural identity used for graph fingerprinting. Functions are
    /// deliberately excluded: two registrations of the same shape with
    /// different closures are considered the same graph.
    fn fingerprint_into(&self, hasher: &mut FxHasher) {
        self.name.hash(hasher);
        self.kind.encode().hash(hasher);
        self.mutates.hash(hasher);
        match &self.when {
            Some(pred) => {
                // Predicate serialization is stable for a given structure.
                serde_json::to_string(pred)
                    .unwrap_or_default()
                    .hash(hasher)
            }
            None => "-".hash(hasher),
        }
    }
}

impl fmt::Debug for NodeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("when", &self.when)
            .field("mutates", &self.mutates)
            .finish_non_exhaustive()
    }
}

/// An immutable, validated dataflow graph.
///
/// Every graph implicitly contains the system input nodes
/// [`execution_id`](crate::types::EXECUTION_ID_NODE) and
/// [`last_updated_at`](crate::types::LAST_UPDATED_AT_NODE); the builder
/// appends them automatically.
pub struct Graph {
    name: String,
    version: String,
    nodes: Vec<NodeDef>,
    index: FxHashMap<String, usize>,
    fingerprint: u64,
}

impl Graph {
    /// Start building a graph with the given identity.
    #[must_use]
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(name, version)
    }

    pub(crate) fn from_validated(
        name: String,
        version: String,
        nodes: Vec<NodeDef>,
    ) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        let mut hasher = FxHasher::default();
        name.hash(&mut hasher);
        version.hash(&mut hasher);
        for node in &nodes {
            node.fingerprint_into(&mut hasher);
        }
        let fingerprint = hasher.finish();
        Self {
            name,
            version,
            nodes,
            index,
            fingerprint,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn graph_ref(&self) -> GraphRef {
        GraphRef::new(self.name.clone(), self.version.clone())
    }

    /// All nodes in declaration order, system nodes included.
    #[must_use]
    pub fn nodes(&self) -> &[NodeDef] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Nodes whose values the engine computes: everything except inputs.
    pub fn computable_nodes(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.iter().filter(|n| !n.kind.is_input())
    }

    /// Nodes gated on `TimeReached(schedule_node)`.
    ///
    /// Used by the recurring-schedule consumption rule: a recurring node
    /// only re-schedules after every such dependant has consumed the
    /// current fire time.
    pub fn time_dependants_of<'a>(
        &'a self,
        schedule_node: &'a str,
    ) -> impl Iterator<Item = &'a NodeDef> {
        self.nodes.iter().filter(move |n| {
            n.when.as_ref().is_some_and(|p| {
                p.conditions().iter().any(|c| {
                    matches!(c, Predicate::TimeReached(target) if target == schedule_node)
                })
            })
        })
    }

    /// Structural fingerprint backing `GraphMismatch` detection.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

/// The implicit system node definitions appended to every graph.
pub(crate) fn system_node_defs() -> Vec<NodeDef> {
    [EXECUTION_ID_NODE, LAST_UPDATED_AT_NODE]
        .into_iter()
        .map(|name| NodeDef {
            name: name.to_string(),
            kind: NodeKind::Input,
            when: None,
            func: None,
            mutates: None,
            attempt_timeout: None,
            max_attempts: None,
        })
        .collect()
}
