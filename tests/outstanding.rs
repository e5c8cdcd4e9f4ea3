//! Outstanding-computation diagnostics and the text/mermaid renderers.

use serde_json::json;
use trellis::graphs::generate_mermaid_graph;
use trellis::runtimes::GetOptions;
use trellis::store::ComputationState;

mod common;
use common::*;

#[tokio::test]
async fn outstanding_lists_every_unsatisfied_computation() {
    let engine = memory_engine();
    engine.register_graph(reminder_graph(1)).unwrap();
    let execution = engine.start_execution("reminders", "v1").await.unwrap();

    let outstanding = engine
        .outstanding_computations(&execution.id)
        .await
        .unwrap();
    let names: Vec<&str> = outstanding.iter().map(|o| o.node_name.as_str()).collect();
    assert_eq!(names, vec!["greeting", "schedule", "reminder"]);

    for entry in &outstanding {
        assert_eq!(entry.state, ComputationState::NotSet);
        assert!(entry.conditions_met.is_empty());
    }
    // One condition per direct upstream dependency.
    assert_eq!(outstanding[0].conditions_not_met.len(), 1);
    assert_eq!(outstanding[1].conditions_not_met.len(), 1);
    assert_eq!(outstanding[2].conditions_not_met.len(), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn conditions_met_grows_as_upstreams_fill_in() {
    let engine = memory_engine();
    engine.register_graph(reminder_graph(3)).unwrap();
    let execution = engine.start_execution("reminders", "v1").await.unwrap();

    engine
        .set(&execution.id, "user_name", json!("Mario"))
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

    // greeting has succeeded and left the outstanding set; the reminder's
    // provided(greeting) leg is now satisfied.
    let outstanding = engine
        .outstanding_computations(&execution.id)
        .await
        .unwrap();
    assert!(!outstanding.iter().any(|o| o.node_name == "greeting"));
    let reminder = outstanding
        .iter()
        .find(|o| o.node_name == "reminder")
        .unwrap();
    assert_eq!(reminder.conditions_met.len(), 1);
    assert_eq!(reminder.conditions_not_met.len(), 1);

    // Once the reminder fires, nothing is outstanding: the engine is at a
    // fixpoint.
    engine
        .get_value(
            &execution.id,
            "reminder",
            GetOptions::wait_any().with_timeout(WAIT),
        )
        .await
        .unwrap();
    let outstanding = engine
        .outstanding_computations(&execution.id)
        .await
        .unwrap();
    assert!(outstanding.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn summarize_renders_values_and_history() {
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

    let summary = engine.summarize(&execution.id).await.unwrap();
    assert!(summary.contains(&execution.id));
    assert!(summary.contains("greetings@v1"));
    assert!(summary.contains("\"Hello, Mario\""));
    assert!(summary.contains("greeting attempt 0 success"));
    assert!(summary.contains("audit:"));

    engine.shutdown().await;
}

#[test]
fn mermaid_renders_the_reminder_topology() {
    let rendered = generate_mermaid_graph(&reminder_graph(1));
    assert!(rendered.contains("user_name([user_name])"));
    assert!(rendered.contains("schedule{{schedule}}"));
    assert!(rendered.contains("greeting --> schedule"));
    assert!(rendered.contains("schedule --> reminder"));
}
