//! Dispatcher worker pool.
//!
//! A bounded pool of tokio workers pulls execution ids from a flume queue.
//! Each pass loads a fresh snapshot, asks the readiness evaluator for
//! candidates, optimistically claims each one, invokes the user function
//! with the filtered input map, and applies the outcome through the store.
//! A worker keeps re-running passes over an execution until nothing
//! completes, which is what drives the recomputation cascade to a
//! fixpoint.
//!
//! Losing a claim is routine — another worker got there first, or the
//! execution revision moved — and is silently skipped; the next readiness
//! pass observes whatever actually committed. Store failures are logged
//! and abandoned to the sweeper, which rebuilds dispatch state from the
//! store on its next tick.

use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::event_bus::{RevisionBus, RevisionEvent};
use crate::graphs::{GraphRegistry, NodeDef};
use crate::node::{NodeFnError, NodeInputs, NodeOutput};
use crate::schedulers::{ready, ReadyCandidate};
use crate::store::records::CompletionOutcome;
use crate::store::{ExecutionSnapshot, Store, StoreError};
use crate::types::NodeKind;
use crate::utils::time::unix_now;

use super::config::EngineConfig;

pub(crate) struct DispatchContext {
    pub store: Arc<dyn Store>,
    pub registry: Arc<GraphRegistry>,
    pub bus: RevisionBus,
    pub config: EngineConfig,
}

/// Shared, closeable handle to the dispatch queue.
///
/// Clones share one underlying sender slot; [`close`](Self::close) empties
/// the slot for every holder at once, which is what lets the worker channel
/// actually disconnect at shutdown no matter how many components (engine,
/// sweeper) hold a handle.
#[derive(Clone)]
pub(crate) struct WorkQueue {
    inner: Arc<Mutex<Option<flume::Sender<String>>>>,
}

impl WorkQueue {
    fn new(sender: flume::Sender<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Enqueue an execution for a readiness pass. No-op after close.
    pub fn nudge(&self, execution_id: &str) {
        if let Some(sender) = self.inner.lock().expect("queue lock poisoned").as_ref() {
            let _ = sender.send(execution_id.to_string());
        }
    }

    fn close(&self) {
        self.inner.lock().expect("queue lock poisoned").take();
    }
}

/// Handle to the running worker pool.
pub struct Dispatcher {
    queue: WorkQueue,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `config.worker_pool_size` workers against a shared queue.
    pub(crate) fn spawn(
        store: Arc<dyn Store>,
        registry: Arc<GraphRegistry>,
        bus: RevisionBus,
        config: EngineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::unbounded::<String>();
        let ctx = Arc::new(DispatchContext {
            store,
            registry,
            bus,
            config: config.clone(),
        });
        let workers = (0..config.worker_pool_size)
            .map(|worker| {
                let ctx = ctx.clone();
                let queue_rx = queue_rx.clone();
                tokio::spawn(async move {
                    while let Ok(execution_id) = queue_rx.recv_async().await {
                        // Drain this execution to a fixpoint before taking
                        // new work; each completed pass may have unblocked
                        // downstream nodes.
                        loop {
                            match run_pass(&ctx, &execution_id).await {
                                Ok(true) => continue,
                                Ok(false) => break,
                                Err(e) => {
                                    warn!(
                                        worker,
                                        execution_id,
                                        error = %e,
                                        "dispatch pass failed"
                                    );
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect();
        Self {
            queue: WorkQueue::new(queue_tx),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue an execution for a readiness pass. Never blocks.
    pub fn nudge(&self, execution_id: &str) {
        self.queue.nudge(execution_id);
    }

    /// A queue handle for the sweeper's nudges.
    pub(crate) fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Close the queue and wait for in-flight passes to finish.
    pub async fn shutdown(&self) {
        self.queue.close();
        let workers = std::mem::take(&mut *self.workers.lock().expect("workers lock poisoned"));
        for handle in workers {
            let _ = handle.await;
        }
    }
}

/// One readiness pass over one execution. Returns whether any attempt
/// completed (success or failure), i.e. whether durable progress was made.
#[instrument(skip(ctx), err)]
pub(crate) async fn run_pass(
    ctx: &DispatchContext,
    execution_id: &str,
) -> Result<bool, StoreError> {
    let snapshot = ctx.store.load_execution(execution_id).await?;
    if snapshot.execution.is_archived() {
        return Ok(false);
    }
    let graph = match ctx.registry.lookup(&snapshot.execution.graph) {
        Ok(graph) => graph,
        Err(e) => {
            warn!(execution_id, error = %e, "execution references unregistered graph");
            return Ok(false);
        }
    };

    let now = unix_now();
    let candidates = ready(&graph, &snapshot, now, ctx.config.retry_policy());
    if candidates.is_empty() {
        return Ok(false);
    }
    debug!(
        execution_id,
        candidates = candidates.len(),
        revision = snapshot.execution.revision,
        "dispatching ready candidates"
    );

    let limit = ctx.config.worker_pool_size.max(1);
    let attempts = candidates
        .into_iter()
        .map(|candidate| attempt_candidate(ctx, &graph, &snapshot, candidate));
    let mut progressed = false;
    let mut outcomes = stream::iter(attempts).buffer_unordered(limit);
    while let Some(completed) = outcomes.next().await {
        progressed |= completed;
    }
    Ok(progressed)
}

/// Claim one candidate, run its function, and apply the outcome.
/// Returns whether a completion committed.
async fn attempt_candidate(
    ctx: &DispatchContext,
    graph: &crate::graphs::Graph,
    snapshot: &ExecutionSnapshot,
    candidate: ReadyCandidate,
) -> bool {
    let execution_id = snapshot.execution.id.as_str();
    let Some(def) = graph.node(&candidate.node_name) else {
        return false;
    };
    let timeout = def
        .attempt_timeout
        .unwrap_or(ctx.config.default_attempt_timeout);
    let deadline = unix_now() + timeout.as_secs() as i64;

    let claim = match ctx
        .store
        .claim_computation(
            execution_id,
            &candidate.node_name,
            deadline,
            candidate.ex_revision,
            candidate.upstream_revisions.clone(),
        )
        .await
    {
        Ok(claim) => claim,
        Err(e) if e.is_conflict() => return false,
        Err(StoreError::Archived { .. }) => return false,
        Err(e) => {
            warn!(execution_id, node = %candidate.node_name, error = %e, "claim failed");
            return false;
        }
    };
    ctx.bus.publish(RevisionEvent::new(
        execution_id,
        candidate.ex_revision + 1,
        None,
    ));

    // Input map: the upstream values the predicate reads, from the
    // snapshot whose revision the claim verified.
    let mut values = FxHashMap::default();
    for name in def.upstreams() {
        if let Some(value) = snapshot.node(&name).and_then(|n| n.value.clone()) {
            values.insert(name, value);
        }
    }
    let inputs = NodeInputs::new(execution_id, values);

    let outcome = match def.func.clone() {
        Some(func) => {
            // Spawned so a panicking user function surfaces as a JoinError
            // instead of tearing down the worker.
            let joined = tokio::spawn(async move { func.call(inputs).await }).await;
            interpret_result(def, joined)
        }
        None => CompletionOutcome::Failed {
            error: json!({ "message": "node has no function" }),
        },
    };

    match ctx.store.complete_computation(&claim, outcome).await {
        Ok(revision) => {
            ctx.bus.publish(RevisionEvent::new(
                execution_id,
                revision,
                Some(def.write_target().to_string()),
            ));
            true
        }
        Err(StoreError::InvalidTransition { .. }) => {
            // The sweeper reaped this attempt past its deadline; the next
            // readiness pass re-evaluates.
            debug!(execution_id, node = %candidate.node_name, "completion lost to reclaim");
            false
        }
        Err(StoreError::Archived { .. }) => false,
        Err(e) => {
            warn!(execution_id, node = %candidate.node_name, error = %e, "completion failed");
            false
        }
    }
}

/// Map the user function's result onto the computation contract.
fn interpret_result(
    def: &NodeDef,
    joined: Result<Result<NodeOutput, NodeFnError>, tokio::task::JoinError>,
) -> CompletionOutcome {
    let output = match joined {
        Err(join_err) => {
            return CompletionOutcome::Failed {
                error: json!({ "message": format!("user function panicked: {join_err}") }),
            }
        }
        Ok(Err(fn_err)) => {
            return CompletionOutcome::Failed {
                error: fn_err.to_payload(),
            }
        }
        Ok(Ok(output)) => output,
    };

    let malformed = |detail: &str| CompletionOutcome::Failed {
        error: json!({ "message": "malformed_result", "detail": detail }),
    };

    match (def.kind, output) {
        (NodeKind::Compute | NodeKind::Mutate, NodeOutput::Value(value)) => {
            CompletionOutcome::Success {
                value,
                write_to: def.write_target().to_string(),
            }
        }
        (NodeKind::Compute | NodeKind::Mutate, _) => {
            malformed("expected a value payload")
        }
        (NodeKind::ScheduleOnce | NodeKind::ScheduleRecurring, NodeOutput::ScheduleAt(t)) => {
            if t > unix_now() {
                CompletionOutcome::Success {
                    value: json!(t),
                    write_to: def.name.clone(),
                }
            } else {
                malformed("schedule time must be in the future")
            }
        }
        (NodeKind::ScheduleOnce | NodeKind::ScheduleRecurring, NodeOutput::NoSchedule) => {
            CompletionOutcome::SuccessNoValue
        }
        (NodeKind::ScheduleOnce | NodeKind::ScheduleRecurring, NodeOutput::Value(_)) => {
            malformed("expected a unix timestamp or no_schedule")
        }
        (NodeKind::Input, _) => malformed("input nodes are never computed"),
    }
}
