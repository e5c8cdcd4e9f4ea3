//! Durable record shapes for executions, node instances, computation
//! attempts, and the audit log.
//!
//! These are explicit serde-friendly structs decoupled from the in-memory
//! engine types; the SQLite gateway persists them as JSON columns and the
//! memory gateway holds them directly. This module performs no I/O.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{GraphRef, Revision};

/// Lifecycle state of a computation attempt.
///
/// `NotSet` is the absence state: it is never persisted on a row (rows are
/// created directly in `Computing`) but appears in diagnostics for nodes
/// that have not yet been attempted. Terminal states never transition
/// further; a new attempt is a new record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputationState {
    NotSet,
    Computing,
    Success,
    Failed,
    Abandoned,
    Cancelled,
}

impl ComputationState {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ComputationState::NotSet => "not_set",
            ComputationState::Computing => "computing",
            ComputationState::Success => "success",
            ComputationState::Failed => "failed",
            ComputationState::Abandoned => "abandoned",
            ComputationState::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "not_set" => Some(ComputationState::NotSet),
            "computing" => Some(ComputationState::Computing),
            "success" => Some(ComputationState::Success),
            "failed" => Some(ComputationState::Failed),
            "abandoned" => Some(ComputationState::Abandoned),
            "cancelled" => Some(ComputationState::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition further.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComputationState::Success
                | ComputationState::Failed
                | ComputationState::Abandoned
                | ComputationState::Cancelled
        )
    }
}

impl fmt::Display for ComputationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Durable execution row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub graph: GraphRef,
    pub revision: Revision,
    pub archived_at: Option<i64>,
    pub created_at: i64,
}

impl ExecutionRecord {
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// Durable per-node value slot. `value: None` means `not_set`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInstanceRecord {
    pub node_name: String,
    pub value: Option<Value>,
    pub set_revision: Revision,
    pub set_time: Option<i64>,
}

impl NodeInstanceRecord {
    #[must_use]
    pub fn unset(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            value: None,
            set_revision: 0,
            set_time: None,
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }
}

/// One attempt at evaluating a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputationRecord {
    pub id: String,
    pub node_name: String,
    pub state: ComputationState,
    pub attempt_index: u32,
    pub started_at: i64,
    pub deadline: i64,
    pub completed_at: Option<i64>,
    /// Execution revision observed when the attempt was dispatched.
    pub ex_revision_at_start: Revision,
    /// `set_revision` of each upstream value used as input.
    pub upstream_revisions: FxHashMap<String, Revision>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

/// Proof of a successful claim, handed back to `complete_computation`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    pub computation_id: String,
    pub execution_id: String,
    pub node_name: String,
    pub attempt_index: u32,
}

/// Terminal outcome applied through `complete_computation`.
#[derive(Clone, Debug, PartialEq)]
pub enum CompletionOutcome {
    /// Successful attempt; `value` is written to the `write_to` node
    /// instance (the node itself, or a mutate target) in the same
    /// transaction.
    Success { value: Value, write_to: String },
    /// Successful attempt that produces no value (a schedule function
    /// declining to schedule).
    SuccessNoValue,
    /// Failed attempt with its error payload.
    Failed { error: Value },
    /// Attempt cancelled (execution archived mid-flight).
    Cancelled,
}

impl CompletionOutcome {
    #[must_use]
    pub fn state(&self) -> ComputationState {
        match self {
            CompletionOutcome::Success { .. } | CompletionOutcome::SuccessNoValue => {
                ComputationState::Success
            }
            CompletionOutcome::Failed { .. } => ComputationState::Failed,
            CompletionOutcome::Cancelled => ComputationState::Cancelled,
        }
    }
}

/// What a sweep reclaimed: one abandoned attempt and the revision the
/// abandonment committed at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReclaimedAttempt {
    pub execution_id: String,
    pub node_name: String,
    pub computation_id: String,
    pub revision: Revision,
}

/// Audit row kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    ValueWrite,
    Touch,
}

impl AuditKind {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            AuditKind::ValueWrite => "value_write",
            AuditKind::Touch => "touch",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "value_write" => Some(AuditKind::ValueWrite),
            "touch" => Some(AuditKind::Touch),
            _ => None,
        }
    }
}

/// One audit-log entry, appended on every value write or touch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub execution_id: String,
    pub revision: Revision,
    pub node_name: String,
    pub kind: AuditKind,
    pub at: i64,
}

/// Consistent read of one execution: the row, every node instance, and the
/// full attempt history ordered by `(started_at, id)`.
#[derive(Clone, Debug)]
pub struct ExecutionSnapshot {
    pub execution: ExecutionRecord,
    pub nodes: FxHashMap<String, NodeInstanceRecord>,
    pub computations: Vec<ComputationRecord>,
}

impl ExecutionSnapshot {
    /// The currently-set values, keyed by node name.
    #[must_use]
    pub fn set_values(&self) -> FxHashMap<String, Value> {
        self.nodes
            .values()
            .filter_map(|n| n.value.clone().map(|v| (n.node_name.clone(), v)))
            .collect()
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeInstanceRecord> {
        self.nodes.get(name)
    }

    /// The in-flight attempt for a node, if any.
    #[must_use]
    pub fn in_flight(&self, node_name: &str) -> Option<&ComputationRecord> {
        self.computations
            .iter()
            .find(|c| c.node_name == node_name && c.state == ComputationState::Computing)
    }

    /// The most recent terminal attempt for a node, if any.
    #[must_use]
    pub fn latest_terminal(&self, node_name: &str) -> Option<&ComputationRecord> {
        self.computations
            .iter()
            .rev()
            .find(|c| c.node_name == node_name && c.state.is_terminal())
    }

    /// Total attempts recorded for a node, in-flight included.
    #[must_use]
    pub fn attempt_count(&self, node_name: &str) -> u32 {
        self.computations
            .iter()
            .filter(|c| c.node_name == node_name)
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_encoding_round_trips() {
        for state in [
            ComputationState::NotSet,
            ComputationState::Computing,
            ComputationState::Success,
            ComputationState::Failed,
            ComputationState::Abandoned,
            ComputationState::Cancelled,
        ] {
            assert_eq!(ComputationState::decode(state.encode()), Some(state));
        }
    }

    #[test]
    fn terminal_partition() {
        assert!(!ComputationState::NotSet.is_terminal());
        assert!(!ComputationState::Computing.is_terminal());
        assert!(ComputationState::Success.is_terminal());
        assert!(ComputationState::Abandoned.is_terminal());
    }
}
