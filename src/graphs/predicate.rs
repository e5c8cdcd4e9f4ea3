//! The upstream predicate language.
//!
//! A node's readiness condition is a boolean expression over other nodes'
//! *presence* and/or *values*. Predicates are plain data: the readiness
//! evaluator interprets them against an execution snapshot, and the
//! diagnostics layer decomposes them into per-dependency conditions for
//! `outstanding_computations`.
//!
//! Evaluation never suspends and never touches the store; all it sees is a
//! map of currently-set values and the wall-clock instant the evaluator was
//! given.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A boolean expression over upstream node values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Satisfied once the named node has a set value.
    Provided(String),
    /// Satisfied once the named node's value equals the given payload.
    ValueEquals(String, Value),
    /// Satisfied once `now >= value(schedule_node)`.
    ///
    /// The referenced node is expected to hold a unix timestamp (a schedule
    /// node's fire time); a non-integer value never satisfies the gate.
    TimeReached(String),
    /// Satisfied when every inner predicate is satisfied. Empty = always.
    All(Vec<Predicate>),
    /// Satisfied when at least one inner predicate is satisfied.
    Any(Vec<Predicate>),
    /// Satisfied when the inner predicate is not.
    Not(Box<Predicate>),
}

/// Snapshot view a predicate is evaluated against: the set values of an
/// execution plus the evaluation instant.
#[derive(Clone, Copy, Debug)]
pub struct ValueLookup<'a> {
    pub values: &'a FxHashMap<String, Value>,
    pub now: i64,
}

impl Predicate {
    pub fn provided(node: impl Into<String>) -> Self {
        Predicate::Provided(node.into())
    }

    pub fn value_equals(node: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::ValueEquals(node.into(), value.into())
    }

    pub fn time_reached(schedule_node: impl Into<String>) -> Self {
        Predicate::TimeReached(schedule_node.into())
    }

    pub fn all(preds: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::All(preds.into_iter().collect())
    }

    pub fn any(preds: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Any(preds.into_iter().collect())
    }

    /// The vacuously true predicate.
    #[must_use]
    pub fn always() -> Self {
        Predicate::All(Vec::new())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(pred: Predicate) -> Self {
        Predicate::Not(Box::new(pred))
    }

    /// Evaluate against a snapshot of set values.
    #[must_use]
    pub fn is_satisfied(&self, lookup: ValueLookup<'_>) -> bool {
        match self {
            Predicate::Provided(node) => lookup.values.contains_key(node),
            Predicate::ValueEquals(node, expected) => {
                lookup.values.get(node) == Some(expected)
            }
            Predicate::TimeReached(node) => lookup
                .values
                .get(node)
                .and_then(Value::as_i64)
                .is_some_and(|t| lookup.now >= t),
            Predicate::All(preds) => preds.iter().all(|p| p.is_satisfied(lookup)),
            Predicate::Any(preds) => preds.iter().any(|p| p.is_satisfied(lookup)),
            Predicate::Not(pred) => !pred.is_satisfied(lookup),
        }
    }

    /// The direct upstream dependencies this predicate reads, deduplicated,
    /// in first-mention order.
    #[must_use]
    pub fn upstreams(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_upstreams(&mut out);
        out
    }

    fn collect_upstreams(&self, out: &mut Vec<String>) {
        match self {
            Predicate::Provided(node)
            | Predicate::ValueEquals(node, _)
            | Predicate::TimeReached(node) => {
                if !out.iter().any(|n| n == node) {
                    out.push(node.clone());
                }
            }
            Predicate::All(preds) | Predicate::Any(preds) => {
                for p in preds {
                    p.collect_upstreams(out);
                }
            }
            Predicate::Not(pred) => pred.collect_upstreams(out),
        }
    }

    /// Decompose into the flat list of conditions reported by
    /// `outstanding_computations`.
    ///
    /// Top-level conjunctions flatten recursively; every other shape is a
    /// single condition. For predicates that mention each upstream exactly
    /// once (the common case), the condition count equals the direct
    /// upstream count.
    #[must_use]
    pub fn conditions(&self) -> Vec<&Predicate> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Predicate>) {
        match self {
            Predicate::All(preds) => {
                for p in preds {
                    p.collect_conditions(out);
                }
            }
            other => out.push(other),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Provided(node) => write!(f, ":{node} is provided"),
            Predicate::ValueEquals(node, value) => write!(f, ":{node} == {value}"),
            Predicate::TimeReached(node) => write!(f, "now() >= :{node}"),
            Predicate::All(preds) => {
                if preds.is_empty() {
                    return write!(f, "always");
                }
                let parts: Vec<String> = preds.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(" and "))
            }
            Predicate::Any(preds) => {
                let parts: Vec<String> = preds.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(" or "))
            }
            Predicate::Not(pred) => write!(f, "not {pred}"),
        }
    }
}
