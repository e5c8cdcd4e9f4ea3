//! Volatile in-memory store for tests and development.
//!
//! A single mutex stands in for the backend's transactions: every gateway
//! call locks, mutates, and unlocks without suspending, so the atomicity
//! guarantees match the SQLite gateway exactly. State does not survive the
//! process.

use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::graphs::Graph;
use crate::types::{Revision, EXECUTION_ID_NODE, LAST_UPDATED_AT_NODE};
use crate::utils::ids::IdGenerator;
use crate::utils::time::unix_now;

use super::records::{
    AuditEntry, AuditKind, Claim, CompletionOutcome, ComputationRecord, ComputationState,
    ExecutionRecord, ExecutionSnapshot, NodeInstanceRecord, ReclaimedAttempt,
};
use super::{Result, Store, StoreError};

#[derive(Debug)]
struct MemoryExecution {
    record: ExecutionRecord,
    nodes: FxHashMap<String, NodeInstanceRecord>,
    computations: Vec<ComputationRecord>,
    audit: Vec<AuditEntry>,
}

/// In-memory [`Store`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<FxHashMap<String, MemoryExecution>>,
    ids: IdGenerator,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_execution<T>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut MemoryExecution) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.inner.lock().expect("store mutex poisoned");
        let exec = guard
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::UnknownExecution {
                execution_id: execution_id.to_string(),
            })?;
        f(exec)
    }
}

fn require_live(exec: &MemoryExecution) -> Result<()> {
    if exec.record.is_archived() {
        return Err(StoreError::Archived {
            execution_id: exec.record.id.clone(),
        });
    }
    Ok(())
}

/// Write `value` into `node_name` at `revision` and refresh the
/// `last_updated_at` system value in the same logical transaction.
fn apply_value_write(
    exec: &mut MemoryExecution,
    node_name: &str,
    value: Value,
    revision: Revision,
    now: i64,
) -> Result<()> {
    let instance =
        exec.nodes
            .get_mut(node_name)
            .ok_or_else(|| StoreError::UnknownNode {
                execution_id: exec.record.id.clone(),
                node_name: node_name.to_string(),
            })?;
    instance.value = Some(value);
    instance.set_revision = revision;
    instance.set_time = Some(now);

    if node_name != LAST_UPDATED_AT_NODE {
        if let Some(touched) = exec.nodes.get_mut(LAST_UPDATED_AT_NODE) {
            touched.value = Some(json!(now));
            touched.set_revision = revision;
            touched.set_time = Some(now);
        }
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_execution(&self, graph: &Graph) -> Result<ExecutionRecord> {
        let now = unix_now();
        let id = self.ids.generate_execution_id();

        let mut nodes: FxHashMap<String, NodeInstanceRecord> = graph
            .nodes()
            .iter()
            .map(|def| (def.name.clone(), NodeInstanceRecord::unset(&def.name)))
            .collect();
        if let Some(instance) = nodes.get_mut(EXECUTION_ID_NODE) {
            instance.value = Some(json!(id.clone()));
            instance.set_time = Some(now);
        }
        if let Some(instance) = nodes.get_mut(LAST_UPDATED_AT_NODE) {
            instance.value = Some(json!(now));
            instance.set_time = Some(now);
        }

        let record = ExecutionRecord {
            id: id.clone(),
            graph: graph.graph_ref(),
            revision: 0,
            archived_at: None,
            created_at: now,
        };

        self.inner.lock().expect("store mutex poisoned").insert(
            id,
            MemoryExecution {
                record: record.clone(),
                nodes,
                computations: Vec::new(),
                audit: Vec::new(),
            },
        );
        Ok(record)
    }

    async fn load_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot> {
        self.with_execution(execution_id, |exec| {
            Ok(ExecutionSnapshot {
                execution: exec.record.clone(),
                nodes: exec.nodes.clone(),
                computations: exec.computations.clone(),
            })
        })
    }

    async fn write_value(
        &self,
        execution_id: &str,
        node_name: &str,
        value: Value,
    ) -> Result<Revision> {
        let now = unix_now();
        self.with_execution(execution_id, |exec| {
            require_live(exec)?;
            let revision = exec.record.revision + 1;
            apply_value_write(exec, node_name, value, revision, now)?;
            exec.record.revision = revision;
            exec.audit.push(AuditEntry {
                execution_id: execution_id.to_string(),
                revision,
                node_name: node_name.to_string(),
                kind: AuditKind::ValueWrite,
                at: now,
            });
            Ok(revision)
        })
    }

    async fn touch_value(&self, execution_id: &str, node_name: &str) -> Result<Revision> {
        let now = unix_now();
        self.with_execution(execution_id, |exec| {
            require_live(exec)?;
            let revision = exec.record.revision + 1;
            let instance =
                exec.nodes
                    .get_mut(node_name)
                    .ok_or_else(|| StoreError::UnknownNode {
                        execution_id: execution_id.to_string(),
                        node_name: node_name.to_string(),
                    })?;
            instance.set_revision = revision;
            exec.record.revision = revision;
            exec.audit.push(AuditEntry {
                execution_id: execution_id.to_string(),
                revision,
                node_name: node_name.to_string(),
                kind: AuditKind::Touch,
                at: now,
            });
            Ok(revision)
        })
    }

    async fn claim_computation(
        &self,
        execution_id: &str,
        node_name: &str,
        deadline: i64,
        ex_rev_seen: Revision,
        upstream_revisions: FxHashMap<String, Revision>,
    ) -> Result<Claim> {
        let now = unix_now();
        let computation_id = self.ids.generate_computation_id();
        self.with_execution(execution_id, |exec| {
            require_live(exec)?;
            if !exec.nodes.contains_key(node_name) {
                return Err(StoreError::UnknownNode {
                    execution_id: execution_id.to_string(),
                    node_name: node_name.to_string(),
                });
            }
            let conflict = || StoreError::Conflict {
                execution_id: execution_id.to_string(),
                node_name: node_name.to_string(),
            };
            if exec.record.revision != ex_rev_seen {
                return Err(conflict());
            }
            let in_flight = exec
                .computations
                .iter()
                .any(|c| c.node_name == node_name && c.state == ComputationState::Computing);
            if in_flight {
                return Err(conflict());
            }

            let attempt_index = exec
                .computations
                .iter()
                .filter(|c| c.node_name == node_name)
                .count() as u32;
            exec.computations.push(ComputationRecord {
                id: computation_id.clone(),
                node_name: node_name.to_string(),
                state: ComputationState::Computing,
                attempt_index,
                started_at: now,
                deadline,
                completed_at: None,
                ex_revision_at_start: ex_rev_seen,
                upstream_revisions,
                result: None,
                error: None,
            });
            exec.record.revision += 1;
            Ok(Claim {
                computation_id,
                execution_id: execution_id.to_string(),
                node_name: node_name.to_string(),
                attempt_index,
            })
        })
    }

    async fn complete_computation(
        &self,
        claim: &Claim,
        outcome: CompletionOutcome,
    ) -> Result<Revision> {
        let now = unix_now();
        self.with_execution(&claim.execution_id, |exec| {
            require_live(exec)?;
            let revision = exec.record.revision + 1;

            let row = exec
                .computations
                .iter_mut()
                .find(|c| c.id == claim.computation_id)
                .ok_or_else(|| StoreError::backend(format!(
                    "claimed computation {} disappeared",
                    claim.computation_id
                )))?;
            if row.state != ComputationState::Computing {
                return Err(StoreError::InvalidTransition {
                    computation_id: claim.computation_id.clone(),
                    state: row.state,
                });
            }

            row.state = outcome.state();
            row.completed_at = Some(now);
            let value_write = match outcome {
                CompletionOutcome::Success { value, write_to } => {
                    row.result = Some(value.clone());
                    Some((write_to, value))
                }
                CompletionOutcome::SuccessNoValue => None,
                CompletionOutcome::Failed { error } => {
                    row.error = Some(error);
                    None
                }
                CompletionOutcome::Cancelled => None,
            };

            if let Some((write_to, value)) = value_write {
                apply_value_write(exec, &write_to, value, revision, now)?;
            }
            exec.record.revision = revision;
            Ok(revision)
        })
    }

    async fn reclaim_abandoned(&self, now: i64) -> Result<Vec<ReclaimedAttempt>> {
        let mut guard = self.inner.lock().expect("store mutex poisoned");
        let mut reclaimed = Vec::new();
        for exec in guard.values_mut() {
            if exec.record.is_archived() {
                continue;
            }
            for row in exec.computations.iter_mut() {
                if row.state == ComputationState::Computing && row.deadline < now {
                    row.state = ComputationState::Abandoned;
                    row.completed_at = Some(now);
                    exec.record.revision += 1;
                    reclaimed.push(ReclaimedAttempt {
                        execution_id: exec.record.id.clone(),
                        node_name: row.node_name.clone(),
                        computation_id: row.id.clone(),
                        revision: exec.record.revision,
                    });
                }
            }
        }
        Ok(reclaimed)
    }

    async fn archive_execution(&self, execution_id: &str) -> Result<i64> {
        let now = unix_now();
        self.with_execution(execution_id, |exec| {
            if let Some(at) = exec.record.archived_at {
                return Ok(at);
            }
            // Cancel in-flight attempts so the history terminates cleanly;
            // their workers fail at commit time with Archived.
            for row in exec.computations.iter_mut() {
                if row.state == ComputationState::Computing {
                    row.state = ComputationState::Cancelled;
                    row.completed_at = Some(now);
                    exec.record.revision += 1;
                }
            }
            exec.record.archived_at = Some(now);
            exec.record.revision += 1;
            Ok(now)
        })
    }

    async fn list_live_executions(
        &self,
        cursor: Option<String>,
        limit: u32,
    ) -> Result<Vec<String>> {
        let guard = self.inner.lock().expect("store mutex poisoned");
        let mut ids: Vec<String> = guard
            .values()
            .filter(|e| !e.record.is_archived())
            .map(|e| e.record.id.clone())
            .collect();
        ids.sort();
        let start = match &cursor {
            Some(cursor) => ids.partition_point(|id| id <= cursor),
            None => 0,
        };
        Ok(ids
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .collect())
    }

    async fn audit_log(&self, execution_id: &str) -> Result<Vec<AuditEntry>> {
        self.with_execution(execution_id, |exec| Ok(exec.audit.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphs::{Graph, Predicate};
    use crate::node::{node_fn, NodeOutput};

    fn graph() -> Graph {
        Graph::builder("g", "v1")
            .input("a")
            .compute(
                "b",
                Predicate::provided("a"),
                node_fn(|_| async { Ok(NodeOutput::Value(json!(1))) }),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn create_seeds_system_values_at_revision_zero() {
        let store = MemoryStore::new();
        let exec = store.create_execution(&graph()).await.unwrap();
        assert_eq!(exec.revision, 0);

        let snapshot = store.load_execution(&exec.id).await.unwrap();
        let id_node = snapshot.node(EXECUTION_ID_NODE).unwrap();
        assert_eq!(id_node.value, Some(json!(exec.id)));
        assert_eq!(id_node.set_revision, 0);
        assert!(snapshot.node(LAST_UPDATED_AT_NODE).unwrap().is_set());
    }

    #[tokio::test]
    async fn write_bumps_revision_by_one_and_audits() {
        let store = MemoryStore::new();
        let exec = store.create_execution(&graph()).await.unwrap();
        let r1 = store.write_value(&exec.id, "a", json!("x")).await.unwrap();
        assert_eq!(r1, 1);
        let r2 = store.write_value(&exec.id, "a", json!("x")).await.unwrap();
        assert_eq!(r2, 2);

        let audit = store.audit_log(&exec.id).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].revision, 2);
        assert_eq!(audit[1].kind, AuditKind::ValueWrite);
    }

    #[tokio::test]
    async fn double_claim_conflicts() {
        let store = MemoryStore::new();
        let exec = store.create_execution(&graph()).await.unwrap();
        let rev = store.write_value(&exec.id, "a", json!("x")).await.unwrap();

        let claim = store
            .claim_computation(&exec.id, "b", unix_now() + 60, rev, FxHashMap::default())
            .await
            .unwrap();
        let err = store
            .claim_computation(
                &exec.id,
                "b",
                unix_now() + 60,
                rev + 1,
                FxHashMap::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Stale revision also conflicts.
        let err = store
            .claim_computation(&exec.id, "b", unix_now() + 60, rev, FxHashMap::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        store
            .complete_computation(
                &claim,
                CompletionOutcome::Success {
                    value: json!(1),
                    write_to: "b".to_string(),
                },
            )
            .await
            .unwrap();
        let snapshot = store.load_execution(&exec.id).await.unwrap();
        assert_eq!(snapshot.node("b").unwrap().value, Some(json!(1)));
    }

    #[tokio::test]
    async fn archived_rejects_mutation() {
        let store = MemoryStore::new();
        let exec = store.create_execution(&graph()).await.unwrap();
        store.archive_execution(&exec.id).await.unwrap();

        let err = store
            .write_value(&exec.id, "a", json!("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Archived { .. }));
        let err = store
            .claim_computation(&exec.id, "b", unix_now() + 60, 1, FxHashMap::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Archived { .. }));
        assert!(store
            .list_live_executions(None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reclaim_abandons_past_deadline_rows() {
        let store = MemoryStore::new();
        let exec = store.create_execution(&graph()).await.unwrap();
        let rev = store.write_value(&exec.id, "a", json!("x")).await.unwrap();
        let now = unix_now();
        let claim = store
            .claim_computation(&exec.id, "b", now - 5, rev, FxHashMap::default())
            .await
            .unwrap();

        let reclaimed = store.reclaim_abandoned(now).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].node_name, "b");

        // The worker's late completion now fails cleanly.
        let err = store
            .complete_computation(
                &claim,
                CompletionOutcome::Success {
                    value: json!(1),
                    write_to: "b".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }
}
