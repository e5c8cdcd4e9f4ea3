/*!
SQLite store gateway.

Durable `Store` implementation over sqlx. Every mutating operation runs in
one transaction: state transition, value write, revision bump, and audit
row become visible together.

## Behavior

- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) run on connect; disabling
  the feature assumes external migration orchestration.
- The at-most-one-concurrent-attempt invariant is enforced by the partial
  unique index `computations_one_computing` on
  `(execution_id, node_name) WHERE state = 'computing'`; a losing claim
  maps the unique violation to `StoreError::Conflict`.
- Payloads, upstream revision vectors, and errors are stored as JSON text
  columns; pure record shapes live in `store::records`.
*/

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool, Transaction};
use tracing::instrument;

use crate::graphs::Graph;
use crate::types::{Revision, EXECUTION_ID_NODE, LAST_UPDATED_AT_NODE};
use crate::utils::ids::IdGenerator;
use crate::utils::time::unix_now;

use super::records::{
    AuditEntry, AuditKind, Claim, CompletionOutcome, ComputationRecord, ComputationState,
    ExecutionRecord, ExecutionSnapshot, NodeInstanceRecord, ReclaimedAttempt,
};
use super::{Result, Store, StoreError};
use crate::types::GraphRef;

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
    ids: IdGenerator,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

fn backend(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::backend(format!("{context}: {e}"))
}

fn to_json(value: &impl serde::Serialize, what: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| backend(what, e))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| backend(what, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

impl SqliteStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `"sqlite://trellis.db"`.
    #[must_use = "store must be used to persist state"]
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| backend("connect", e))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| backend("migrate", e))?;
        }
        Ok(Self {
            pool: Arc::new(pool),
            ids: IdGenerator::new(),
        })
    }

    /// Load the execution row inside `tx`, erroring on absence.
    async fn load_record_tx(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        execution_id: &str,
    ) -> Result<ExecutionRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, graph_name, graph_version, revision, archived_at, created_at
            FROM executions WHERE id = ?1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| backend("select execution", e))?
        .ok_or_else(|| StoreError::UnknownExecution {
            execution_id: execution_id.to_string(),
        })?;
        Ok(record_from_row(&row))
    }

    /// Load the execution row and reject archived executions.
    async fn load_live_record_tx(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        execution_id: &str,
    ) -> Result<ExecutionRecord> {
        let record = Self::load_record_tx(tx, execution_id).await?;
        if record.is_archived() {
            return Err(StoreError::Archived {
                execution_id: execution_id.to_string(),
            });
        }
        Ok(record)
    }

    async fn bump_revision_tx(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        execution_id: &str,
        new_revision: Revision,
    ) -> Result<()> {
        sqlx::query("UPDATE executions SET revision = ?2 WHERE id = ?1")
            .bind(execution_id)
            .bind(new_revision as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| backend("bump revision", e))?;
        Ok(())
    }

    /// Write a node value at `revision` and refresh `last_updated_at`.
    async fn write_instance_tx(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        execution_id: &str,
        node_name: &str,
        value: &Value,
        revision: Revision,
        now: i64,
    ) -> Result<()> {
        let value_json = to_json(value, "value")?;
        let updated = sqlx::query(
            r#"
            UPDATE node_instances
            SET value_json = ?3, set_revision = ?4, set_time = ?5
            WHERE execution_id = ?1 AND node_name = ?2
            "#,
        )
        .bind(execution_id)
        .bind(node_name)
        .bind(&value_json)
        .bind(revision as i64)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| backend("update node instance", e))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::UnknownNode {
                execution_id: execution_id.to_string(),
                node_name: node_name.to_string(),
            });
        }

        if node_name != LAST_UPDATED_AT_NODE {
            sqlx::query(
                r#"
                UPDATE node_instances
                SET value_json = ?3, set_revision = ?4, set_time = ?5
                WHERE execution_id = ?1 AND node_name = ?2
                "#,
            )
            .bind(execution_id)
            .bind(LAST_UPDATED_AT_NODE)
            .bind(to_json(&json!(now), "last_updated_at")?)
            .bind(revision as i64)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| backend("update last_updated_at", e))?;
        }
        Ok(())
    }

    async fn append_audit_tx(
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        execution_id: &str,
        revision: Revision,
        node_name: &str,
        kind: AuditKind,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (execution_id, revision, node_name, kind, at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(execution_id)
        .bind(revision as i64)
        .bind(node_name)
        .bind(kind.encode())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| backend("insert audit row", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, sqlx::Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))
    }
}

fn record_from_row(row: &SqliteRow) -> ExecutionRecord {
    ExecutionRecord {
        id: row.get("id"),
        graph: GraphRef::new(
            row.get::<String, _>("graph_name"),
            row.get::<String, _>("graph_version"),
        ),
        revision: row.get::<i64, _>("revision") as Revision,
        archived_at: row.get::<Option<i64>, _>("archived_at"),
        created_at: row.get::<i64, _>("created_at"),
    }
}

fn instance_from_row(row: &SqliteRow) -> Result<NodeInstanceRecord> {
    let value = match row.get::<Option<String>, _>("value_json") {
        Some(raw) => Some(from_json(&raw, "value_json")?),
        None => None,
    };
    Ok(NodeInstanceRecord {
        node_name: row.get("node_name"),
        value,
        set_revision: row.get::<i64, _>("set_revision") as Revision,
        set_time: row.get::<Option<i64>, _>("set_time"),
    })
}

fn computation_from_row(row: &SqliteRow) -> Result<ComputationRecord> {
    let state_raw: String = row.get("state");
    let state = ComputationState::decode(&state_raw)
        .ok_or_else(|| StoreError::backend(format!("unknown computation state: {state_raw}")))?;
    let upstream_raw: String = row.get("upstream_revisions_json");
    let result = match row.get::<Option<String>, _>("result_json") {
        Some(raw) => Some(from_json(&raw, "result_json")?),
        None => None,
    };
    let error = match row.get::<Option<String>, _>("error_json") {
        Some(raw) => Some(from_json(&raw, "error_json")?),
        None => None,
    };
    Ok(ComputationRecord {
        id: row.get("id"),
        node_name: row.get("node_name"),
        state,
        attempt_index: row.get::<i64, _>("attempt_index") as u32,
        started_at: row.get::<i64, _>("started_at"),
        deadline: row.get::<i64, _>("deadline"),
        completed_at: row.get::<Option<i64>, _>("completed_at"),
        ex_revision_at_start: row.get::<i64, _>("ex_revision_at_start") as Revision,
        upstream_revisions: from_json(&upstream_raw, "upstream_revisions_json")?,
        result,
        error,
    })
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, graph), err)]
    async fn create_execution(&self, graph: &Graph) -> Result<ExecutionRecord> {
        let now = unix_now();
        let id = self.ids.generate_execution_id();
        let graph_ref = graph.graph_ref();

        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO executions (id, graph_name, graph_version, revision, archived_at, created_at)
            VALUES (?1, ?2, ?3, 0, NULL, ?4)
            "#,
        )
        .bind(&id)
        .bind(&graph_ref.name)
        .bind(&graph_ref.version)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("insert execution", e))?;

        for def in graph.nodes() {
            let (value_json, set_time) = match def.name.as_str() {
                EXECUTION_ID_NODE => (Some(to_json(&json!(id.clone()), "execution_id")?), Some(now)),
                LAST_UPDATED_AT_NODE => (Some(to_json(&json!(now), "last_updated_at")?), Some(now)),
                _ => (None, None),
            };
            sqlx::query(
                r#"
                INSERT INTO node_instances (execution_id, node_name, value_json, set_revision, set_time)
                VALUES (?1, ?2, ?3, 0, ?4)
                "#,
            )
            .bind(&id)
            .bind(&def.name)
            .bind(value_json)
            .bind(set_time)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("insert node instance", e))?;
        }

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(ExecutionRecord {
            id,
            graph: graph_ref,
            revision: 0,
            archived_at: None,
            created_at: now,
        })
    }

    #[instrument(skip(self), err)]
    async fn load_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot> {
        let mut tx = self.begin().await?;
        let execution = Self::load_record_tx(&mut tx, execution_id).await?;

        let node_rows = sqlx::query(
            r#"
            SELECT node_name, value_json, set_revision, set_time
            FROM node_instances WHERE execution_id = ?1
            "#,
        )
        .bind(execution_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| backend("select node instances", e))?;
        let mut nodes = FxHashMap::default();
        for row in &node_rows {
            let instance = instance_from_row(row)?;
            nodes.insert(instance.node_name.clone(), instance);
        }

        let computation_rows = sqlx::query(
            r#"
            SELECT id, node_name, state, attempt_index, started_at, deadline, completed_at,
                   ex_revision_at_start, upstream_revisions_json, result_json, error_json
            FROM computations WHERE execution_id = ?1
            ORDER BY started_at, id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| backend("select computations", e))?;
        let computations = computation_rows
            .iter()
            .map(computation_from_row)
            .collect::<Result<Vec<_>>>()?;

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(ExecutionSnapshot {
            execution,
            nodes,
            computations,
        })
    }

    #[instrument(skip(self, value), err)]
    async fn write_value(
        &self,
        execution_id: &str,
        node_name: &str,
        value: Value,
    ) -> Result<Revision> {
        let now = unix_now();
        let mut tx = self.begin().await?;
        let record = Self::load_live_record_tx(&mut tx, execution_id).await?;
        let revision = record.revision + 1;

        Self::write_instance_tx(&mut tx, execution_id, node_name, &value, revision, now).await?;
        Self::bump_revision_tx(&mut tx, execution_id, revision).await?;
        Self::append_audit_tx(
            &mut tx,
            execution_id,
            revision,
            node_name,
            AuditKind::ValueWrite,
            now,
        )
        .await?;

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(revision)
    }

    #[instrument(skip(self), err)]
    async fn touch_value(&self, execution_id: &str, node_name: &str) -> Result<Revision> {
        let now = unix_now();
        let mut tx = self.begin().await?;
        let record = Self::load_live_record_tx(&mut tx, execution_id).await?;
        let revision = record.revision + 1;

        let updated = sqlx::query(
            r#"
            UPDATE node_instances SET set_revision = ?3
            WHERE execution_id = ?1 AND node_name = ?2
            "#,
        )
        .bind(execution_id)
        .bind(node_name)
        .bind(revision as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("touch node instance", e))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::UnknownNode {
                execution_id: execution_id.to_string(),
                node_name: node_name.to_string(),
            });
        }

        Self::bump_revision_tx(&mut tx, execution_id, revision).await?;
        Self::append_audit_tx(
            &mut tx,
            execution_id,
            revision,
            node_name,
            AuditKind::Touch,
            now,
        )
        .await?;

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(revision)
    }

    #[instrument(skip(self, upstream_revisions), err)]
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
        let conflict = || StoreError::Conflict {
            execution_id: execution_id.to_string(),
            node_name: node_name.to_string(),
        };

        let mut tx = self.begin().await?;
        let record = Self::load_live_record_tx(&mut tx, execution_id).await?;
        if record.revision != ex_rev_seen {
            return Err(conflict());
        }

        let attempt_index: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM computations WHERE execution_id = ?1 AND node_name = ?2",
        )
        .bind(execution_id)
        .bind(node_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| backend("count attempts", e))?
        .get("n");

        // The partial unique index rejects a second computing row; that is
        // the whole mutual-exclusion story.
        let inserted = sqlx::query(
            r#"
            INSERT INTO computations (
                id, execution_id, node_name, state, attempt_index, started_at,
                deadline, completed_at, ex_revision_at_start, upstream_revisions_json,
                result_json, error_json
            ) VALUES (?1, ?2, ?3, 'computing', ?4, ?5, ?6, NULL, ?7, ?8, NULL, NULL)
            "#,
        )
        .bind(&computation_id)
        .bind(execution_id)
        .bind(node_name)
        .bind(attempt_index)
        .bind(now)
        .bind(deadline)
        .bind(ex_rev_seen as i64)
        .bind(to_json(&upstream_revisions, "upstream_revisions")?)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(conflict()),
            Err(e) => return Err(backend("insert computation", e)),
        }

        Self::bump_revision_tx(&mut tx, execution_id, record.revision + 1).await?;
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(Claim {
            computation_id,
            execution_id: execution_id.to_string(),
            node_name: node_name.to_string(),
            attempt_index: attempt_index as u32,
        })
    }

    #[instrument(skip(self, claim, outcome), err)]
    async fn complete_computation(
        &self,
        claim: &Claim,
        outcome: CompletionOutcome,
    ) -> Result<Revision> {
        let now = unix_now();
        let mut tx = self.begin().await?;
        let record = Self::load_live_record_tx(&mut tx, &claim.execution_id).await?;
        let revision = record.revision + 1;

        let state_raw: String = sqlx::query("SELECT state FROM computations WHERE id = ?1")
            .bind(&claim.computation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| backend("select computation", e))?
            .ok_or_else(|| {
                StoreError::backend(format!(
                    "claimed computation {} disappeared",
                    claim.computation_id
                ))
            })?
            .get("state");
        let state = ComputationState::decode(&state_raw)
            .ok_or_else(|| StoreError::backend(format!("unknown computation state: {state_raw}")))?;
        if state != ComputationState::Computing {
            return Err(StoreError::InvalidTransition {
                computation_id: claim.computation_id.clone(),
                state,
            });
        }

        let (result_json, error_json, value_write) = match &outcome {
            CompletionOutcome::Success { value, write_to } => (
                Some(to_json(value, "result")?),
                None,
                Some((write_to.clone(), value.clone())),
            ),
            CompletionOutcome::SuccessNoValue => (None, None, None),
            CompletionOutcome::Failed { error } => (None, Some(to_json(error, "error")?), None),
            CompletionOutcome::Cancelled => (None, None, None),
        };

        sqlx::query(
            r#"
            UPDATE computations
            SET state = ?2, completed_at = ?3, result_json = ?4, error_json = ?5
            WHERE id = ?1
            "#,
        )
        .bind(&claim.computation_id)
        .bind(outcome.state().encode())
        .bind(now)
        .bind(result_json)
        .bind(error_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("update computation", e))?;

        if let Some((write_to, value)) = value_write {
            Self::write_instance_tx(&mut tx, &claim.execution_id, &write_to, &value, revision, now)
                .await?;
        }

        Self::bump_revision_tx(&mut tx, &claim.execution_id, revision).await?;
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(revision)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_abandoned(&self, now: i64) -> Result<Vec<ReclaimedAttempt>> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.execution_id, c.node_name
            FROM computations c
            JOIN executions e ON e.id = c.execution_id
            WHERE c.state = 'computing' AND c.deadline < ?1 AND e.archived_at IS NULL
            ORDER BY c.execution_id, c.started_at
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| backend("select stale computations", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let computation_id: String = row.get("id");
            let execution_id: String = row.get("execution_id");
            let node_name: String = row.get("node_name");

            sqlx::query(
                "UPDATE computations SET state = 'abandoned', completed_at = ?2 WHERE id = ?1",
            )
            .bind(&computation_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("abandon computation", e))?;

            sqlx::query("UPDATE executions SET revision = revision + 1 WHERE id = ?1")
                .bind(&execution_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| backend("bump revision", e))?;
            let revision: i64 =
                sqlx::query("SELECT revision FROM executions WHERE id = ?1")
                    .bind(&execution_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| backend("read revision", e))?
                    .get("revision");

            reclaimed.push(ReclaimedAttempt {
                execution_id,
                node_name,
                computation_id,
                revision: revision as Revision,
            });
        }

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(reclaimed)
    }

    #[instrument(skip(self), err)]
    async fn archive_execution(&self, execution_id: &str) -> Result<i64> {
        let now = unix_now();
        let mut tx = self.begin().await?;
        let record = Self::load_record_tx(&mut tx, execution_id).await?;
        if let Some(at) = record.archived_at {
            return Ok(at);
        }

        let cancelled = sqlx::query(
            r#"
            UPDATE computations SET state = 'cancelled', completed_at = ?2
            WHERE execution_id = ?1 AND state = 'computing'
            "#,
        )
        .bind(execution_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("cancel computations", e))?
        .rows_affected();

        sqlx::query(
            "UPDATE executions SET archived_at = ?2, revision = revision + ?3 WHERE id = ?1",
        )
        .bind(execution_id)
        .bind(now)
        .bind(cancelled as i64 + 1)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("archive execution", e))?;

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(now)
    }

    #[instrument(skip(self), err)]
    async fn list_live_executions(
        &self,
        cursor: Option<String>,
        limit: u32,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM executions
            WHERE archived_at IS NULL AND (?1 IS NULL OR id > ?1)
            ORDER BY id
            LIMIT ?2
            "#,
        )
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("select live executions", e))?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self), err)]
    async fn audit_log(&self, execution_id: &str) -> Result<Vec<AuditEntry>> {
        // Existence check keeps the API symmetric with the memory store.
        let mut tx = self.begin().await?;
        Self::load_record_tx(&mut tx, execution_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT execution_id, revision, node_name, kind, at
            FROM audit_log WHERE execution_id = ?1
            ORDER BY revision
            "#,
        )
        .bind(execution_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| backend("select audit log", e))?;
        tx.commit().await.map_err(|e| backend("tx commit", e))?;

        rows.iter()
            .map(|row| {
                let kind_raw: String = row.get("kind");
                let kind = AuditKind::decode(&kind_raw)
                    .ok_or_else(|| StoreError::backend(format!("unknown audit kind: {kind_raw}")))?;
                Ok(AuditEntry {
                    execution_id: row.get("execution_id"),
                    revision: row.get::<i64, _>("revision") as Revision,
                    node_name: row.get("node_name"),
                    kind,
                    at: row.get::<i64, _>("at"),
                })
            })
            .collect()
    }
}
