//! Core types for the trellis dataflow engine.
//!
//! This module defines the fundamental identifiers used throughout the
//! system: node kinds, graph references, and the per-execution revision
//! counter. These are the domain concepts that define what a dataflow
//! graph *is*; runtime infrastructure types live in [`crate::runtimes`].
//!
//! # Examples
//!
//! ```rust
//! use trellis::types::{GraphRef, NodeKind};
//!
//! let kind = NodeKind::Compute;
//! assert_eq!(kind.encode(), "compute");
//! assert_eq!(NodeKind::decode("compute"), Some(NodeKind::Compute));
//!
//! let graph_ref = GraphRef::new("greetings", "v1");
//! assert_eq!(graph_ref.to_string(), "greetings@v1");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic per-execution revision counter.
///
/// The revision starts at 0 when an execution is created and is bumped by
/// exactly one inside the transaction of every durable mutation: value
/// writes, touches, claims, completions, and abandonments.
pub type Revision = u64;

/// Name of the system node holding the execution's own id.
pub const EXECUTION_ID_NODE: &str = "execution_id";

/// Name of the system node holding the unix time of the last value write.
pub const LAST_UPDATED_AT_NODE: &str = "last_updated_at";

/// Returns `true` for node names reserved by the engine.
#[must_use]
pub fn is_system_node(name: &str) -> bool {
    name == EXECUTION_ID_NODE || name == LAST_UPDATED_AT_NODE
}

/// Determines how a node's value is produced.
///
/// `Input` nodes receive values from callers; every other kind derives its
/// value (or its target's value, for `Mutate`) by running a user function
/// once its upstream predicate is satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Value written by the caller via `set`; never computed.
    Input,
    /// Derives its own value from upstream values.
    Compute,
    /// Computes a single future fire time (unix seconds) as its value.
    ScheduleOnce,
    /// Computes a fire time and re-schedules after dependants consume it.
    ScheduleRecurring,
    /// Computes a value written to another node (the `mutates` target).
    Mutate,
}

impl NodeKind {
    /// Encode a kind into its persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Compute => "compute",
            NodeKind::ScheduleOnce => "schedule_once",
            NodeKind::ScheduleRecurring => "schedule_recurring",
            NodeKind::Mutate => "mutate",
        }
    }

    /// Decode a persisted string form back into a kind.
    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "input" => Some(NodeKind::Input),
            "compute" => Some(NodeKind::Compute),
            "schedule_once" => Some(NodeKind::ScheduleOnce),
            "schedule_recurring" => Some(NodeKind::ScheduleRecurring),
            "mutate" => Some(NodeKind::Mutate),
            _ => None,
        }
    }

    /// Returns `true` if this is an [`Input`](Self::Input) node.
    #[must_use]
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input)
    }

    /// Returns `true` for either schedule kind.
    #[must_use]
    pub fn is_schedule(&self) -> bool {
        matches!(self, Self::ScheduleOnce | Self::ScheduleRecurring)
    }

    /// Returns `true` if this is a [`Mutate`](Self::Mutate) node.
    #[must_use]
    pub fn is_mutate(&self) -> bool {
        matches!(self, Self::Mutate)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Identity of an immutable graph definition: `(name, version)`.
///
/// Re-registering the same pair with a structurally different definition
/// fails with `GraphMismatch`; see [`crate::graphs::GraphRegistry`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphRef {
    pub name: String,
    pub version: String,
}

impl GraphRef {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_encode_decode_round_trip() {
        for kind in [
            NodeKind::Input,
            NodeKind::Compute,
            NodeKind::ScheduleOnce,
            NodeKind::ScheduleRecurring,
            NodeKind::Mutate,
        ] {
            assert_eq!(NodeKind::decode(kind.encode()), Some(kind));
        }
        assert_eq!(NodeKind::decode("bogus"), None);
    }

    #[test]
    fn system_node_names_are_reserved() {
        assert!(is_system_node(EXECUTION_ID_NODE));
        assert!(is_system_node(LAST_UPDATED_AT_NODE));
        assert!(!is_system_node("greeting"));
    }
}
