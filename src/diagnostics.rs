//! Read-only diagnostic views over an execution.
//!
//! These render from snapshots handed to them; they never mutate the
//! store. The mermaid renderer lives in [`crate::graphs::mermaid`].

use serde_json::Value;

use crate::graphs::{Graph, ValueLookup};
use crate::store::records::{AuditEntry, ComputationState, ExecutionSnapshot};
use crate::types::is_system_node;

/// One not-yet-successful computation and the state of its conditions.
#[derive(Clone, Debug, PartialEq)]
pub struct OutstandingComputation {
    pub node_name: String,
    /// State of the latest attempt; `NotSet` when none exists.
    pub state: ComputationState,
    /// Rendered conditions currently satisfied.
    pub conditions_met: Vec<String>,
    /// Rendered conditions still blocking.
    pub conditions_not_met: Vec<String>,
}

/// Computations whose node has no successful attempt yet, in graph
/// declaration order, with each predicate decomposed into per-dependency
/// conditions and partitioned by satisfaction.
#[must_use]
pub fn outstanding_computations(
    graph: &Graph,
    snapshot: &ExecutionSnapshot,
    now: i64,
) -> Vec<OutstandingComputation> {
    let values = snapshot.set_values();
    let lookup = ValueLookup {
        values: &values,
        now,
    };

    graph
        .computable_nodes()
        .filter_map(|def| {
            let latest = snapshot.computations.iter().rev().find(|c| c.node_name == def.name);
            if latest.is_some_and(|c| c.state == ComputationState::Success) {
                return None;
            }
            let state = latest.map(|c| c.state).unwrap_or(ComputationState::NotSet);

            let mut conditions_met = Vec::new();
            let mut conditions_not_met = Vec::new();
            if let Some(when) = &def.when {
                for condition in when.conditions() {
                    if condition.is_satisfied(lookup) {
                        conditions_met.push(condition.to_string());
                    } else {
                        conditions_not_met.push(condition.to_string());
                    }
                }
            }

            Some(OutstandingComputation {
                node_name: def.name.clone(),
                state,
                conditions_met,
                conditions_not_met,
            })
        })
        .collect()
}

/// Human-readable summary of an execution: header, node values, attempt
/// history, and the audit tail.
#[must_use]
pub fn summarize(graph: &Graph, snapshot: &ExecutionSnapshot, audit: &[AuditEntry]) -> String {
    let execution = &snapshot.execution;
    let mut out = String::new();
    out.push_str(&format!(
        "execution {} of {} @ revision {}{}\n",
        execution.id,
        execution.graph,
        execution.revision,
        if execution.is_archived() {
            " (archived)"
        } else {
            ""
        },
    ));

    out.push_str("\nnodes:\n");
    for def in graph.nodes() {
        if is_system_node(&def.name) {
            continue;
        }
        let line = match snapshot.node(&def.name) {
            Some(instance) if instance.is_set() => format!(
                "  {} [{}] = {} (rev {})",
                def.name,
                def.kind,
                render_value(instance.value.as_ref()),
                instance.set_revision,
            ),
            _ => format!("  {} [{}] not set", def.name, def.kind),
        };
        out.push_str(&line);
        out.push('\n');
    }

    if !snapshot.computations.is_empty() {
        out.push_str("\ncomputations:\n");
        for c in &snapshot.computations {
            out.push_str(&format!(
                "  {} attempt {} {} (rev at start {})\n",
                c.node_name, c.attempt_index, c.state, c.ex_revision_at_start,
            ));
        }
    }

    if !audit.is_empty() {
        out.push_str("\naudit:\n");
        for entry in audit {
            out.push_str(&format!(
                "  rev {} {:?} {}\n",
                entry.revision, entry.kind, entry.node_name,
            ));
        }
    }

    out
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        Some(v) => {
            let rendered = v.to_string();
            if rendered.chars().count() > 64 {
                let truncated: String = rendered.chars().take(63).collect();
                format!("{truncated}…")
            } else {
                rendered
            }
        }
        None => "∅".to_string(),
    }
}
