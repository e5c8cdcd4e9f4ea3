//! SQLite gateway: the same transactional contract as the memory store,
//! exercised against a real database file.

use rustc_hash::FxHashMap;
use serde_json::json;
use tempfile::TempDir;
use trellis::graphs::{Graph, Predicate};
use trellis::node::{node_fn, NodeOutput};
use trellis::runtimes::GetOptions;
use trellis::store::{AuditKind, CompletionOutcome, ComputationState, SqliteStore, Store, StoreError};
use trellis::utils::time::unix_now;

mod common;
use common::*;

fn db_url(dir: &TempDir) -> String {
    let path = dir.path().join("trellis-test.db");
    std::fs::File::create(&path).expect("create db file");
    format!("sqlite://{}", path.display())
}

fn simple_graph() -> Graph {
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
async fn lifecycle_round_trips_through_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::connect(&db_url(&dir)).await.unwrap();
    let graph = simple_graph();

    let exec = store.create_execution(&graph).await.unwrap();
    assert_eq!(exec.revision, 0);

    let r1 = store.write_value(&exec.id, "a", json!("x")).await.unwrap();
    assert_eq!(r1, 1);

    let mut upstream = FxHashMap::default();
    upstream.insert("a".to_string(), r1);
    let claim = store
        .claim_computation(&exec.id, "b", unix_now() + 60, r1, upstream.clone())
        .await
        .unwrap();
    assert_eq!(claim.attempt_index, 0);

    let r3 = store
        .complete_computation(
            &claim,
            CompletionOutcome::Success {
                value: json!("computed"),
                write_to: "b".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(r3, 3);

    let snapshot = store.load_execution(&exec.id).await.unwrap();
    assert_eq!(snapshot.execution.revision, 3);
    let b = snapshot.node("b").unwrap();
    assert_eq!(b.value, Some(json!("computed")));
    assert_eq!(b.set_revision, 3);
    let attempt = snapshot.latest_terminal("b").unwrap();
    assert_eq!(attempt.state, ComputationState::Success);
    assert_eq!(attempt.ex_revision_at_start, r1);
    assert_eq!(attempt.upstream_revisions, upstream);

    let audit = store.audit_log(&exec.id).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, AuditKind::ValueWrite);

    let touched = store.touch_value(&exec.id, "a").await.unwrap();
    assert_eq!(touched, 4);
    let audit = store.audit_log(&exec.id).await.unwrap();
    assert_eq!(audit[1].kind, AuditKind::Touch);
}

#[tokio::test]
async fn unique_index_rejects_a_second_computing_row() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::connect(&db_url(&dir)).await.unwrap();
    let exec = store.create_execution(&simple_graph()).await.unwrap();
    let rev = store.write_value(&exec.id, "a", json!(1)).await.unwrap();

    store
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

    // A stale revision observation also conflicts.
    let err = store
        .claim_computation(&exec.id, "b", unix_now() + 60, rev, FxHashMap::default())
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn reclaim_then_late_completion_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::connect(&db_url(&dir)).await.unwrap();
    let exec = store.create_execution(&simple_graph()).await.unwrap();
    let rev = store.write_value(&exec.id, "a", json!(1)).await.unwrap();

    let claim = store
        .claim_computation(&exec.id, "b", unix_now() - 5, rev, FxHashMap::default())
        .await
        .unwrap();

    let reclaimed = store.reclaim_abandoned(unix_now()).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].node_name, "b");

    let err = store
        .complete_computation(
            &claim,
            CompletionOutcome::Failed {
                error: json!({"message": "late"}),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    // A fresh claim is admissible again after the reclaim.
    let snapshot = store.load_execution(&exec.id).await.unwrap();
    store
        .claim_computation(
            &exec.id,
            "b",
            unix_now() + 60,
            snapshot.execution.revision,
            FxHashMap::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn archive_cancels_in_flight_and_hides_from_listing() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::connect(&db_url(&dir)).await.unwrap();
    let exec = store.create_execution(&simple_graph()).await.unwrap();
    let rev = store.write_value(&exec.id, "a", json!(1)).await.unwrap();
    let claim = store
        .claim_computation(&exec.id, "b", unix_now() + 60, rev, FxHashMap::default())
        .await
        .unwrap();

    store.archive_execution(&exec.id).await.unwrap();

    let err = store.write_value(&exec.id, "a", json!(2)).await.unwrap_err();
    assert!(matches!(err, StoreError::Archived { .. }));
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
    assert!(matches!(err, StoreError::Archived { .. }));

    let snapshot = store.load_execution(&exec.id).await.unwrap();
    assert!(snapshot.execution.is_archived());
    assert_eq!(
        snapshot.latest_terminal("b").unwrap().state,
        ComputationState::Cancelled
    );
    assert!(store
        .list_live_executions(None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn engine_over_sqlite_runs_the_basic_flow() {
    let dir = TempDir::new().unwrap();
    let engine = std::sync::Arc::new(
        trellis::runtimes::Engine::connect_sqlite(&db_url(&dir), test_config())
            .await
            .unwrap(),
    );
    engine.register_graph(greeting_graph()).unwrap();
    let execution = engine.start_execution("greetings", "v1").await.unwrap();

    engine
        .set(&execution.id, "user_name", json!("Mario"))
        .await
        .unwrap();
    engine
        .set(&execution.id, "actual_name", json!("Bowser"))
        .await
        .unwrap();

    let greeting = engine
        .get_value(
            &execution.id,
            "greeting",
            GetOptions::wait_any().with_timeout(WAIT),
        )
        .await
        .unwrap();
    assert_eq!(greeting, json!("Hello, Mario"));

    engine.shutdown().await;
}
