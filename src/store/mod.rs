//! The persistent store gateway.
//!
//! All durable state lives behind the [`Store`] trait: executions, node
//! instances (value + revision), computation attempts, and the audit log.
//! The gateway is the safety boundary of the whole engine — workers and
//! sweepers may race freely because every mutation here is transactional
//! and [`claim_computation`](Store::claim_computation) is the single place
//! the *at-most-one-concurrent-attempt-per-node* invariant is enforced.
//!
//! Two implementations ship: [`MemoryStore`] (volatile, for tests and
//! development) and [`SqliteStore`] (durable, sqlx-backed).
//!
//! # Revision discipline
//!
//! An execution is created at revision 0. Every mutating gateway call —
//! `write_value`, `touch_value`, `claim_computation`,
//! `complete_computation`, and each row reclaimed by `reclaim_abandoned` —
//! bumps the execution revision by exactly one inside its transaction.
//! Nothing else moves the counter.

pub mod memory;
pub mod records;
pub mod sqlite;

pub use memory::MemoryStore;
pub use records::{
    AuditEntry, AuditKind, Claim, CompletionOutcome, ComputationRecord, ComputationState,
    ExecutionRecord, ExecutionSnapshot, NodeInstanceRecord, ReclaimedAttempt,
};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::graphs::Graph;
use crate::types::Revision;

/// Errors surfaced by store gateways.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("unknown execution: {execution_id}")]
    #[diagnostic(code(trellis::store::unknown_execution))]
    UnknownExecution { execution_id: String },

    #[error("unknown node {node_name} in execution {execution_id}")]
    #[diagnostic(code(trellis::store::unknown_node))]
    UnknownNode {
        execution_id: String,
        node_name: String,
    },

    #[error("execution {execution_id} is archived")]
    #[diagnostic(
        code(trellis::store::archived),
        help("Archived executions reject every further mutation.")
    )]
    Archived { execution_id: String },

    /// Optimistic claim lost a race: another attempt is in flight or the
    /// execution revision moved past the one the caller observed. Never
    /// surfaced to users; workers skip and the next readiness pass
    /// re-evaluates.
    #[error("claim conflict on {node_name} in execution {execution_id}")]
    #[diagnostic(code(trellis::store::conflict))]
    Conflict {
        execution_id: String,
        node_name: String,
    },

    /// Completion applied to a row that is no longer `computing` (reaped
    /// by the sweeper, or completed by a duplicated worker).
    #[error("computation {computation_id} is {state}, not computing")]
    #[diagnostic(code(trellis::store::invalid_transition))]
    InvalidTransition {
        computation_id: String,
        state: ComputationState,
    },

    #[error("store backend error: {message}")]
    #[diagnostic(code(trellis::store::backend))]
    Backend { message: String },

    #[error("store serialization error: {source}")]
    #[diagnostic(code(trellis::store::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
        }
    }

    /// `true` for the internal claim-race signal.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Transactional operations over executions, node instances, and
/// computation attempts.
///
/// Implementations must guarantee that each method is atomic: value update,
/// revision bump, and state transition inside one call become visible
/// together or not at all.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Create a durable execution for `graph` at revision 0, seeding one
    /// unset node instance per node plus the system values `execution_id`
    /// and `last_updated_at`.
    async fn create_execution(&self, graph: &Graph) -> Result<ExecutionRecord>;

    /// Consistent read of the execution row, all node instances, and the
    /// full computation history.
    async fn load_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot>;

    /// Write a node value: update the instance, bump the revision, refresh
    /// `last_updated_at`, and append an audit row. Revision-generating even
    /// when the payload is unchanged.
    async fn write_value(
        &self,
        execution_id: &str,
        node_name: &str,
        value: Value,
    ) -> Result<Revision>;

    /// Bump a node's `set_revision` without changing its value (the
    /// `increment_revision` diagnostic). The node must be set.
    async fn touch_value(&self, execution_id: &str, node_name: &str) -> Result<Revision>;

    /// Insert a `computing` attempt iff no other attempt for this
    /// `(execution, node)` is currently computing *and* the execution
    /// revision still equals `ex_rev_seen`; bumps the revision on success.
    /// Loses with [`StoreError::Conflict`].
    async fn claim_computation(
        &self,
        execution_id: &str,
        node_name: &str,
        deadline: i64,
        ex_rev_seen: Revision,
        upstream_revisions: FxHashMap<String, Revision>,
    ) -> Result<Claim>;

    /// Atomically transition the claimed attempt to its terminal state,
    /// write the value (for successes), and bump the revision.
    async fn complete_computation(
        &self,
        claim: &Claim,
        outcome: CompletionOutcome,
    ) -> Result<Revision>;

    /// Transition every `computing` attempt with `deadline < now` to
    /// `abandoned`, bumping the owning execution's revision once per row.
    async fn reclaim_abandoned(&self, now: i64) -> Result<Vec<ReclaimedAttempt>>;

    /// Set `archived_at`, hiding the execution from sweeps and rejecting
    /// all further mutation.
    async fn archive_execution(&self, execution_id: &str) -> Result<i64>;

    /// Page through non-archived execution ids, ordered by id; pass the
    /// last id of the previous page as `cursor`.
    async fn list_live_executions(
        &self,
        cursor: Option<String>,
        limit: u32,
    ) -> Result<Vec<String>>;

    /// The audit log for one execution, in revision order.
    async fn audit_log(&self, execution_id: &str) -> Result<Vec<AuditEntry>>;
}
