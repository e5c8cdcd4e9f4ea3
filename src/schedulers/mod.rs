//! Revision-gated readiness evaluation.
//!
//! This module is the dependency-resolution core of the engine: given an
//! execution snapshot, [`ready`] returns the set of nodes whose upstream
//! predicates are satisfied and whose last attempt is stale with respect to
//! upstream revisions. The evaluator is a pure function — deterministic,
//! side-effect free, and never suspending — so the dispatcher and the
//! sweeper can both drive it against whatever snapshot they hold.
//!
//! # Core Concepts
//!
//! - **Upstream revision vector**: the `set_revision` of each node a
//!   predicate reads, captured at claim time and persisted on the attempt.
//! - **Staleness**: a node is stale iff it has never succeeded, or some
//!   upstream's `set_revision` now exceeds the revision recorded on its
//!   latest success. Recomputation cascades are a *consequence* of this
//!   comparison, not a separate mechanism.
//! - **Retry gating**: failed and abandoned attempts become candidates
//!   again only after an exponential backoff elapses and while attempts
//!   remain in the budget.

use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::graphs::{Graph, NodeDef, ValueLookup};
use crate::store::records::{ComputationState, ExecutionSnapshot};
use crate::types::{NodeKind, Revision};

/// A node eligible for dispatch, with the optimistic claim inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyCandidate {
    pub node_name: String,
    /// Execution revision observed in the snapshot; the claim loses if the
    /// revision has moved by claim time.
    pub ex_revision: Revision,
    /// Unblocking revision vector: `set_revision` of each upstream the
    /// predicate reads.
    pub upstream_revisions: FxHashMap<String, Revision>,
}

/// Retry discipline for failed and abandoned attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Exponential backoff for the attempt that just finished:
    /// `base * 2^attempt_index`, capped.
    #[must_use]
    pub fn backoff_after(&self, attempt_index: u32) -> Duration {
        let capped_exp = attempt_index.min(32);
        let backoff = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(capped_exp));
        backoff.min(self.backoff_cap)
    }

    /// Apply a node's per-definition overrides.
    #[must_use]
    pub fn for_node(mut self, def: &NodeDef) -> Self {
        if let Some(max_attempts) = def.max_attempts {
            self.max_attempts = max_attempts;
        }
        self
    }
}

/// Evaluate readiness across every computable node of an execution.
///
/// Returns candidates in graph declaration order. Archived executions
/// yield nothing.
#[must_use]
pub fn ready(
    graph: &Graph,
    snapshot: &ExecutionSnapshot,
    now: i64,
    defaults: RetryPolicy,
) -> Vec<ReadyCandidate> {
    if snapshot.execution.is_archived() {
        return Vec::new();
    }

    let values = snapshot.set_values();
    let lookup = ValueLookup {
        values: &values,
        now,
    };

    graph
        .computable_nodes()
        .filter_map(|def| {
            if !is_candidate(graph, def, snapshot, lookup, now, defaults.for_node(def)) {
                return None;
            }
            let upstream_revisions = upstream_revision_vector(def, snapshot);
            Some(ReadyCandidate {
                node_name: def.name.clone(),
                ex_revision: snapshot.execution.revision,
                upstream_revisions,
            })
        })
        .collect()
}

/// The `set_revision` of each upstream the node's predicate reads.
/// Unset upstreams contribute revision 0.
#[must_use]
pub fn upstream_revision_vector(
    def: &NodeDef,
    snapshot: &ExecutionSnapshot,
) -> FxHashMap<String, Revision> {
    def.upstreams()
        .into_iter()
        .map(|name| {
            let revision = snapshot.node(&name).map(|n| n.set_revision).unwrap_or(0);
            (name, revision)
        })
        .collect()
}

fn is_candidate(
    graph: &Graph,
    def: &NodeDef,
    snapshot: &ExecutionSnapshot,
    lookup: ValueLookup<'_>,
    now: i64,
    policy: RetryPolicy,
) -> bool {
    let satisfied = def
        .when
        .as_ref()
        .map(|p| p.is_satisfied(lookup))
        .unwrap_or(false);
    if !satisfied {
        return false;
    }
    if snapshot.in_flight(&def.name).is_some() {
        return false;
    }

    match snapshot.latest_terminal(&def.name) {
        None => true,
        Some(last) => {
            if upstreams_advanced(def, snapshot, &last.upstream_revisions) {
                return true;
            }
            match last.state {
                ComputationState::Success => {
                    def.kind == NodeKind::ScheduleRecurring
                        && recurring_due_again(graph, def, snapshot, now)
                }
                ComputationState::Failed | ComputationState::Abandoned => {
                    retry_eligible(snapshot, def, last.attempt_index, last.completed_at, now, policy)
                }
                // Cancelled attempts retry only on fresh upstream input.
                ComputationState::Cancelled => false,
                ComputationState::Computing | ComputationState::NotSet => false,
            }
        }
    }
}

/// True iff any upstream's current `set_revision` exceeds the revision the
/// attempt recorded for it.
fn upstreams_advanced(
    def: &NodeDef,
    snapshot: &ExecutionSnapshot,
    recorded: &FxHashMap<String, Revision>,
) -> bool {
    def.upstreams().into_iter().any(|name| {
        let current = snapshot.node(&name).map(|n| n.set_revision).unwrap_or(0);
        let seen = recorded.get(&name).copied().unwrap_or(0);
        current > seen
    })
}

fn retry_eligible(
    snapshot: &ExecutionSnapshot,
    def: &NodeDef,
    attempt_index: u32,
    completed_at: Option<i64>,
    now: i64,
    policy: RetryPolicy,
) -> bool {
    if snapshot.attempt_count(&def.name) >= policy.max_attempts {
        return false;
    }
    let backoff = policy.backoff_after(attempt_index).as_secs() as i64;
    let eligible_at = completed_at.unwrap_or(0) + backoff;
    now >= eligible_at
}

/// A recurring schedule re-fires once its persisted fire time has passed
/// and every dependant gated on `TimeReached(self)` has consumed the
/// current fire time. The consumption gate is what prevents a dependant
/// from being double-fired: rescheduling bumps this node's revision, which
/// would immediately re-stale any dependant still working off the old time.
fn recurring_due_again(
    graph: &Graph,
    def: &NodeDef,
    snapshot: &ExecutionSnapshot,
    now: i64,
) -> bool {
    let Some(instance) = snapshot.node(&def.name) else {
        return false;
    };
    let Some(fire_at) = instance.value.as_ref().and_then(serde_json::Value::as_i64) else {
        return false;
    };
    if now < fire_at {
        return false;
    }

    graph.time_dependants_of(&def.name).all(|dependant| {
        snapshot
            .latest_terminal(&dependant.name)
            .filter(|c| c.state == ComputationState::Success)
            .is_some_and(|c| {
                c.upstream_revisions.get(&def.name).copied().unwrap_or(0)
                    >= instance.set_revision
            })
    })
}
