//! Shared fixtures for integration tests: graphs from the README
//! scenarios, fast engine configurations, and wait helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use trellis::graphs::{Graph, Predicate};
use trellis::node::{node_fn, NodeOutput};
use trellis::runtimes::{Engine, EngineConfig};
use trellis::utils::time::unix_now;

pub const WAIT: Duration = Duration::from_secs(10);

/// Route engine tracing through the test harness; honors `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast config: frequent sweeps, small pool, sub-second backoff.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_sweep_interval(Duration::from_millis(200))
        .with_worker_pool_size(2)
        .with_backoff(Duration::from_millis(10), Duration::from_secs(1))
}

pub fn memory_engine() -> Arc<Engine> {
    init_tracing();
    Arc::new(Engine::in_memory(test_config()))
}

/// Engine whose background sweeper effectively never fires, for tests
/// that drive `sweep_now` deterministically.
pub fn quiet_engine() -> Arc<Engine> {
    init_tracing();
    Arc::new(Engine::in_memory(
        test_config().with_sweep_interval(Duration::from_secs(3600)),
    ))
}

/// S1/S2 graph: `greeting` depends on both inputs, reads `user_name`.
pub fn greeting_graph() -> Graph {
    Graph::builder("greetings", "v1")
        .input("user_name")
        .input("actual_name")
        .compute(
            "greeting",
            Predicate::all([
                Predicate::provided("user_name"),
                Predicate::provided("actual_name"),
            ]),
            node_fn(|inputs| async move {
                let name = inputs.require_str("user_name")?.to_string();
                Ok(NodeOutput::Value(json!(format!("Hello, {name}"))))
            }),
        )
        .build()
        .expect("greeting graph is valid")
}

/// S3/S4 graph: input → greeting → schedule (fires `delay` seconds out)
/// → reminder gated on the greeting and the schedule time.
pub fn reminder_graph(delay: i64) -> Graph {
    Graph::builder("reminders", "v1")
        .input("user_name")
        .compute(
            "greeting",
            Predicate::provided("user_name"),
            node_fn(|inputs| async move {
                let name = inputs.require_str("user_name")?.to_string();
                Ok(NodeOutput::Value(json!(format!("Hello, {name}"))))
            }),
        )
        .schedule_once(
            "schedule",
            Predicate::provided("greeting"),
            node_fn(move |_| async move { Ok(NodeOutput::ScheduleAt(unix_now() + delay)) }),
        )
        .compute(
            "reminder",
            Predicate::all([
                Predicate::provided("greeting"),
                Predicate::time_reached("schedule"),
            ]),
            node_fn(|inputs| async move {
                let greeting = inputs.require_str("greeting")?.to_string();
                Ok(NodeOutput::Value(json!(format!("Reminder: {greeting}"))))
            }),
        )
        .build()
        .expect("reminder graph is valid")
}
