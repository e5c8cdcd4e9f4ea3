//! Revision discipline: one bump per durable mutation, monotonic strictly
//! increasing, and the forced-recompute diagnostic.

use std::time::Duration;

use serde_json::json;
use trellis::runtimes::GetOptions;
use trellis::store::ComputationState;

mod common;
use common::*;

/// Creation at 0, one input write, then three computations at one claim +
/// one complete each: 1 + 3 × 2 = 7.
#[tokio::test]
async fn reminder_flow_lands_on_revision_seven() {
    let engine = memory_engine();
    engine.register_graph(reminder_graph(2)).unwrap();
    let execution = engine.start_execution("reminders", "v1").await.unwrap();
    assert_eq!(execution.revision, 0);

    engine
        .set(&execution.id, "user_name", json!("Mario"))
        .await
        .unwrap();
    engine
        .get_value(
            &execution.id,
            "reminder",
            GetOptions::wait_any().with_timeout(WAIT),
        )
        .await
        .unwrap();

    let record = engine.load(&execution.id).await.unwrap();
    assert_eq!(record.revision, 7);

    let snapshot = engine.load_snapshot(&execution.id).await.unwrap();
    for node in ["greeting", "schedule", "reminder"] {
        let successes = snapshot
            .computations
            .iter()
            .filter(|c| c.node_name == node && c.state == ComputationState::Success)
            .count();
        assert_eq!(successes, 1, "exactly one success for {node}");
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn same_value_set_still_triggers_recompute() {
    let engine = memory_engine();
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
    engine
        .get_value(
            &execution.id,
            "greeting",
            GetOptions::wait_any().with_timeout(WAIT),
        )
        .await
        .unwrap();
    let before = engine.load(&execution.id).await.unwrap().revision;

    // Writes are revision-generating, not value-diffing.
    let waiter = {
        let engine = engine.clone();
        let id = execution.id.clone();
        tokio::spawn(async move {
            engine
                .get_value(&id, "greeting", GetOptions::wait_new().with_timeout(WAIT))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let rewrite = engine
        .set(&execution.id, "user_name", json!("Mario"))
        .await
        .unwrap();
    assert!(rewrite > before);

    let renewed = waiter.await.unwrap().unwrap();
    assert_eq!(renewed, json!("Hello, Mario"));

    let snapshot = engine.load_snapshot(&execution.id).await.unwrap();
    let attempts = snapshot
        .computations
        .iter()
        .filter(|c| c.node_name == "greeting")
        .count();
    assert!(attempts >= 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn increment_revision_forces_the_whole_cascade() {
    let engine = memory_engine();
    engine.register_graph(reminder_graph(2)).unwrap();
    let execution = engine.start_execution("reminders", "v1").await.unwrap();

    engine
        .set(&execution.id, "user_name", json!("Mario"))
        .await
        .unwrap();
    engine
        .get_value(
            &execution.id,
            "reminder",
            GetOptions::wait_any().with_timeout(WAIT),
        )
        .await
        .unwrap();
    let steady = engine.load(&execution.id).await.unwrap().revision;

    let waiter = {
        let engine = engine.clone();
        let id = execution.id.clone();
        tokio::spawn(async move {
            engine
                .get_value(&id, "reminder", GetOptions::wait_new().with_timeout(WAIT))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let touched = engine
        .increment_revision(&execution.id, "user_name")
        .await
        .unwrap();
    assert_eq!(touched, steady + 1);

    // The touch restales greeting, which restales the schedule, which
    // eventually refires the reminder.
    waiter.await.unwrap().unwrap();
    let after = engine.load(&execution.id).await.unwrap().revision;
    assert!(after > touched);

    engine.shutdown().await;
}

#[tokio::test]
async fn quiescent_sweeps_are_a_fixpoint() {
    let engine = memory_engine();
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
    engine
        .get_value(
            &execution.id,
            "greeting",
            GetOptions::wait_any().with_timeout(WAIT),
        )
        .await
        .unwrap();

    let before = engine.load_snapshot(&execution.id).await.unwrap();
    for _ in 0..3 {
        engine.sweep_now().await.unwrap();
    }
    // Give any spuriously dispatched work time to land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = engine.load_snapshot(&execution.id).await.unwrap();

    assert_eq!(before.execution.revision, after.execution.revision);
    assert_eq!(before.computations.len(), after.computations.len());

    engine.shutdown().await;
}
