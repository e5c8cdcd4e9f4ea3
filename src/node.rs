use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

/// Errors a user function can surface to the engine.
///
/// A `NodeFnError` is recorded on the computation attempt as its error
/// payload and the attempt transitions to `Failed`; retry policy then
/// decides whether a new attempt is scheduled. For errors that should halt
/// nothing (partial data, degraded output), return a successful value
/// describing the degradation instead.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeFnError {
    /// Expected upstream value is missing from the input map.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(trellis::node::missing_input),
        help("Check that the node's upstream predicate names every value the function reads.")
    )]
    MissingInput { what: &'static str },

    /// Input value present but not of the expected shape.
    #[error("malformed input {what}: expected {expected}")]
    #[diagnostic(code(trellis::node::malformed_input))]
    MalformedInput {
        what: &'static str,
        expected: &'static str,
    },

    /// External provider or service error.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(trellis::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON serialization/deserialization error inside the function.
    #[error(transparent)]
    #[diagnostic(code(trellis::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Any other failure the function wants recorded verbatim.
    #[error("{0}")]
    #[diagnostic(code(trellis::node::other))]
    Other(String),
}

impl NodeFnError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Render this error as the JSON payload persisted on the attempt.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::json!({ "message": self.to_string() })
    }
}

/// What a user function produced.
///
/// Compute and mutate functions return [`Value`](NodeOutput::Value);
/// schedule functions return [`ScheduleAt`](NodeOutput::ScheduleAt) with a
/// future unix timestamp, or [`NoSchedule`](NodeOutput::NoSchedule) to
/// decline. Anything else is recorded as `failed(malformed_result)` by the
/// dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeOutput {
    /// A value payload for the node (or its mutate target).
    Value(Value),
    /// A fire time in unix seconds; must be in the future.
    ScheduleAt(i64),
    /// The schedule function declines to schedule anything.
    NoSchedule,
}

impl NodeOutput {
    /// Convenience for `NodeOutput::Value(json!(...))`-style construction.
    pub fn value(v: impl Into<Value>) -> Self {
        NodeOutput::Value(v.into())
    }
}

/// The filtered value map handed to a user function.
///
/// Contains exactly the upstream values the node's predicate reads, taken
/// from the execution snapshot observed at claim time, plus the execution
/// id for functions that need to correlate external side effects.
#[derive(Clone, Debug)]
pub struct NodeInputs {
    execution_id: String,
    values: FxHashMap<String, Value>,
}

impl NodeInputs {
    #[must_use]
    pub fn new(execution_id: impl Into<String>, values: FxHashMap<String, Value>) -> Self {
        Self {
            execution_id: execution_id.into(),
            values,
        }
    }

    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Fetch a required input, failing with `MissingInput` if absent.
    pub fn require(&self, name: &'static str) -> Result<&Value, NodeFnError> {
        self.values
            .get(name)
            .ok_or(NodeFnError::MissingInput { what: name })
    }

    /// Fetch a required string input.
    pub fn require_str(&self, name: &'static str) -> Result<&str, NodeFnError> {
        self.require(name)?
            .as_str()
            .ok_or(NodeFnError::MalformedInput {
                what: name,
                expected: "string",
            })
    }

    /// Fetch a required integer input.
    pub fn require_i64(&self, name: &'static str) -> Result<i64, NodeFnError> {
        self.require(name)?
            .as_i64()
            .ok_or(NodeFnError::MalformedInput {
                what: name,
                expected: "integer",
            })
    }

    /// All provided values, keyed by upstream node name.
    #[must_use]
    pub fn values(&self) -> &FxHashMap<String, Value> {
        &self.values
    }
}

/// A user-supplied node function.
///
/// Implementations must be pure of process state (they may perform I/O) and
/// idempotent or tolerant of re-runs: a crashed process abandons in-flight
/// attempts and the sweeper re-dispatches them, so the function can observe
/// its own prior side effects.
///
/// Most callers use the [`node_fn`] adapter rather than implementing the
/// trait by hand:
///
/// ```rust
/// use trellis::node::{node_fn, NodeOutput};
/// use serde_json::json;
///
/// let greet = node_fn(|inputs| async move {
///     let name = inputs.require_str("user_name")?.to_string();
///     Ok(NodeOutput::Value(json!(format!("Hello, {name}"))))
/// });
/// # let _ = greet;
/// ```
#[async_trait]
pub trait NodeFn: Send + Sync {
    async fn call(&self, inputs: NodeInputs) -> Result<NodeOutput, NodeFnError>;
}

struct FnNode<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> NodeFn for FnNode<F>
where
    F: Fn(NodeInputs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, NodeFnError>> + Send,
{
    async fn call(&self, inputs: NodeInputs) -> Result<NodeOutput, NodeFnError> {
        (self.f)(inputs).await
    }
}

/// Wrap an async closure as a [`NodeFn`].
pub fn node_fn<F, Fut>(f: F) -> Arc<dyn NodeFn>
where
    F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput, NodeFnError>> + Send + 'static,
{
    Arc::new(FnNode { f })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs_with(name: &str, value: Value) -> NodeInputs {
        let mut values = FxHashMap::default();
        values.insert(name.to_string(), value);
        NodeInputs::new("exec-1", values)
    }

    #[tokio::test]
    async fn fn_adapter_passes_inputs_through() {
        let f = node_fn(|inputs| async move {
            let who = inputs.require_str("who")?.to_string();
            Ok(NodeOutput::Value(json!(format!("hi {who}"))))
        });
        let out = f.call(inputs_with("who", json!("mario"))).await.unwrap();
        assert_eq!(out, NodeOutput::Value(json!("hi mario")));
    }

    #[test]
    fn require_reports_missing_and_malformed() {
        let inputs = inputs_with("n", json!(3));
        assert!(matches!(
            inputs.require("absent"),
            Err(NodeFnError::MissingInput { what: "absent" })
        ));
        assert!(matches!(
            inputs.require_str("n"),
            Err(NodeFnError::MalformedInput { what: "n", .. })
        ));
        assert_eq!(inputs.require_i64("n").unwrap(), 3);
    }

    #[test]
    fn error_payload_carries_message() {
        let payload = NodeFnError::other("boom").to_payload();
        assert_eq!(payload["message"], json!("boom"));
    }
}
