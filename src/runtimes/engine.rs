//! The engine: process-wide assembly of registry, store, bus, dispatcher
//! pool, and sweeper, exposing the user-facing operations.
//!
//! # Architecture
//!
//! - **[`Engine`]** owns the runtime environment; graphs are registered
//!   once and executions are cheap durable records against them.
//! - **Writes** (`set`, `increment_revision`) go through the store, emit a
//!   bus event, and nudge the dispatcher, which drives the recomputation
//!   cascade to a fixpoint.
//! - **Reads** (`get_value`, `values`, `load`) are read-through; waiting
//!   reads park on the revision bus and re-check the store on every event,
//!   so a missed event degrades liveness only.
//!
//! ```text
//! set/touch ──► Store ──► RevisionBus ──► waiters (wait_any / wait_new)
//!     │            ▲
//!     └─ nudge ────┤
//!                  │
//! Dispatcher ◄── ready() ◄── snapshot        Sweeper ── reclaim + nudge
//! ```

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

use crate::diagnostics::{self, OutstandingComputation};
use crate::event_bus::{RevisionBus, RevisionEvent};
use crate::graphs::{Graph, GraphRegistry, RegistryError};
use crate::store::records::ComputationState;
use crate::store::{ExecutionRecord, ExecutionSnapshot, MemoryStore, SqliteStore, Store, StoreError};
use crate::types::Revision;
use crate::utils::time::unix_now;

use super::config::EngineConfig;
use super::dispatcher::Dispatcher;
use super::sweeper::{SweepReport, Sweeper, SweeperHandle};

/// Errors surfaced by engine operations.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("unknown node {node_name} in graph {graph_ref}")]
    #[diagnostic(code(trellis::engine::unknown_node))]
    UnknownNode {
        graph_ref: crate::types::GraphRef,
        node_name: String,
    },

    #[error("node {node_name} is not a settable input")]
    #[diagnostic(
        code(trellis::engine::not_an_input),
        help("Only input nodes accept values via set; system nodes are engine-managed.")
    )]
    NotAnInput { node_name: String },

    #[error("value of {node_name} is not set")]
    #[diagnostic(code(trellis::engine::value_not_set))]
    ValueNotSet { node_name: String },

    #[error("timed out waiting for {node_name}")]
    #[diagnostic(code(trellis::engine::wait_timeout))]
    WaitTimeout { node_name: String },

    #[error("node {node_name} is unreachable: retries exhausted")]
    #[diagnostic(
        code(trellis::engine::unreachable),
        help("Inspect last_error and the computation history; fresh upstream input reopens retries.")
    )]
    Unreachable {
        node_name: String,
        last_error: Option<Value>,
    },
}

/// How `get_value` behaves when the value is not (or not newly) set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Return immediately; unset values error with `ValueNotSet`.
    NoWait,
    /// Resolve as soon as the node's value becomes set.
    WaitAny,
    /// Resolve when a write newer than the revision observed at call time
    /// commits.
    WaitNew,
}

/// Options for [`Engine::get_value`].
#[derive(Clone, Copy, Debug)]
pub struct GetOptions {
    pub wait: WaitMode,
    pub timeout: Option<Duration>,
}

impl GetOptions {
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            wait: WaitMode::NoWait,
            timeout: None,
        }
    }

    #[must_use]
    pub fn wait_any() -> Self {
        Self {
            wait: WaitMode::WaitAny,
            timeout: None,
        }
    }

    #[must_use]
    pub fn wait_new() -> Self {
        Self {
            wait: WaitMode::WaitNew,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Process-wide dataflow engine.
///
/// # Examples
///
/// ```rust,no_run
/// use trellis::graphs::{Graph, Predicate};
/// use trellis::node::{node_fn, NodeOutput};
/// use trellis::runtimes::{Engine, EngineConfig, GetOptions};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = Engine::in_memory(EngineConfig::default());
/// engine.register_graph(
///     Graph::builder("greetings", "v1")
///         .input("user_name")
///         .compute(
///             "greeting",
///             Predicate::provided("user_name"),
///             node_fn(|inputs| async move {
///                 let name = inputs.require_str("user_name")?.to_string();
///                 Ok(NodeOutput::Value(json!(format!("Hello, {name}"))))
///             }),
///         )
///         .build()?,
/// )?;
///
/// let execution = engine.start_execution("greetings", "v1").await?;
/// engine.set(&execution.id, "user_name", json!("Mario")).await?;
/// let greeting = engine
///     .get_value(&execution.id, "greeting", GetOptions::wait_any())
///     .await?;
/// assert_eq!(greeting, json!("Hello, Mario"));
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    store: Arc<dyn Store>,
    registry: Arc<GraphRegistry>,
    bus: RevisionBus,
    dispatcher: Dispatcher,
    sweeper: Sweeper,
    sweeper_handle: std::sync::Mutex<Option<SweeperHandle>>,
    config: EngineConfig,
}

impl Engine {
    /// Assemble an engine over an arbitrary store and spawn its worker
    /// pool and sweeper.
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        let registry = Arc::new(GraphRegistry::new());
        let bus = RevisionBus::new();
        let dispatcher = Dispatcher::spawn(
            store.clone(),
            registry.clone(),
            bus.clone(),
            config.clone(),
        );
        let sweeper = Sweeper::new(store.clone(), bus.clone(), dispatcher.queue());
        let sweeper_handle = std::sync::Mutex::new(Some(sweeper.clone().spawn(config.sweep_interval)));
        Self {
            store,
            registry,
            bus,
            dispatcher,
            sweeper,
            sweeper_handle,
            config,
        }
    }

    /// Engine over the volatile in-memory store.
    #[must_use]
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Engine over a SQLite database at `database_url`
    /// (e.g. `"sqlite://trellis.db"`).
    pub async fn connect_sqlite(
        database_url: &str,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        // Ensure the underlying file exists so a bare path URL works.
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let store = SqliteStore::connect(database_url).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Engine over the SQLite database named by the configuration (or the
    /// `TRELLIS_SQLITE_DB` environment variable, or `trellis.db`).
    pub async fn sqlite(config: EngineConfig) -> Result<Self, EngineError> {
        let name = config
            .sqlite_db_name
            .clone()
            .unwrap_or_else(|| "trellis.db".to_string());
        Self::connect_sqlite(&format!("sqlite://{name}"), config).await
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<GraphRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a validated graph definition.
    pub fn register_graph(&self, graph: Graph) -> Result<Arc<Graph>, EngineError> {
        Ok(self.registry.register(graph)?)
    }

    /// Create a durable execution of a registered graph and nudge the
    /// dispatcher.
    #[instrument(skip(self), err)]
    pub async fn start_execution(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ExecutionRecord, EngineError> {
        let graph_ref = crate::types::GraphRef::new(name, version);
        let graph = self.registry.lookup(&graph_ref)?;
        let record = self.store.create_execution(&graph).await?;
        self.dispatcher.nudge(&record.id);
        Ok(record)
    }

    /// Write an input value. Revision-generating even when the payload is
    /// unchanged, so downstream recomputation always triggers.
    #[instrument(skip(self, value), err)]
    pub async fn set(
        &self,
        execution_id: &str,
        node_name: &str,
        value: Value,
    ) -> Result<Revision, EngineError> {
        let snapshot = self.store.load_execution(execution_id).await?;
        let graph = self.registry.lookup(&snapshot.execution.graph)?;
        let def = graph
            .node(node_name)
            .ok_or_else(|| EngineError::UnknownNode {
                graph_ref: snapshot.execution.graph.clone(),
                node_name: node_name.to_string(),
            })?;
        if !def.kind.is_input() || crate::types::is_system_node(node_name) {
            return Err(EngineError::NotAnInput {
                node_name: node_name.to_string(),
            });
        }

        let revision = self.store.write_value(execution_id, node_name, value).await?;
        self.bus.publish(RevisionEvent::new(
            execution_id,
            revision,
            Some(node_name.to_string()),
        ));
        self.dispatcher.nudge(execution_id);
        Ok(revision)
    }

    /// Diagnostic touch: bump a node's `set_revision` without changing its
    /// value, forcing downstream recomputation.
    #[instrument(skip(self), err)]
    pub async fn increment_revision(
        &self,
        execution_id: &str,
        node_name: &str,
    ) -> Result<Revision, EngineError> {
        let snapshot = self.store.load_execution(execution_id).await?;
        let graph = self.registry.lookup(&snapshot.execution.graph)?;
        if graph.node(node_name).is_none() {
            return Err(EngineError::UnknownNode {
                graph_ref: snapshot.execution.graph.clone(),
                node_name: node_name.to_string(),
            });
        }

        let revision = self.store.touch_value(execution_id, node_name).await?;
        self.bus.publish(RevisionEvent::new(
            execution_id,
            revision,
            Some(node_name.to_string()),
        ));
        self.dispatcher.nudge(execution_id);
        Ok(revision)
    }

    /// Read a node's value, optionally parking on the revision bus.
    #[instrument(skip(self, options), err)]
    pub async fn get_value(
        &self,
        execution_id: &str,
        node_name: &str,
        options: GetOptions,
    ) -> Result<Value, EngineError> {
        // Subscribe before reading the baseline so a racing write is
        // never missed.
        let events = self.bus.subscribe(execution_id);
        let mut snapshot = self.store.load_execution(execution_id).await?;
        let graph = self.registry.lookup(&snapshot.execution.graph)?;
        if graph.node(node_name).is_none() {
            return Err(EngineError::UnknownNode {
                graph_ref: snapshot.execution.graph.clone(),
                node_name: node_name.to_string(),
            });
        }
        let baseline = snapshot
            .node(node_name)
            .map(|n| n.set_revision)
            .unwrap_or(0);
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let instance = snapshot.node(node_name);
            let current = instance.and_then(|n| n.value.clone());
            match options.wait {
                WaitMode::NoWait => {
                    return current.ok_or_else(|| EngineError::ValueNotSet {
                        node_name: node_name.to_string(),
                    })
                }
                WaitMode::WaitAny => {
                    if let Some(value) = current {
                        return Ok(value);
                    }
                }
                WaitMode::WaitNew => {
                    if let (Some(value), Some(node)) = (current, instance) {
                        if node.set_revision > baseline {
                            return Ok(value);
                        }
                    }
                }
            }

            let received = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, events.recv_async()).await {
                        Ok(received) => received,
                        Err(_) => return Err(self.wait_expired(&snapshot, node_name)),
                    }
                }
                None => events.recv_async().await,
            };
            if received.is_err() {
                return Err(EngineError::Store(StoreError::Backend {
                    message: "revision bus closed".to_string(),
                }));
            }
            snapshot = self.store.load_execution(execution_id).await?;
        }
    }

    /// Classify an expired wait: exhausted retries surface the recorded
    /// error as `Unreachable`, anything else is a plain timeout.
    fn wait_expired(&self, snapshot: &ExecutionSnapshot, node_name: &str) -> EngineError {
        let graph = self.registry.lookup(&snapshot.execution.graph).ok();
        let policy = graph
            .as_ref()
            .and_then(|g| g.node(node_name))
            .map(|def| self.config.retry_policy().for_node(def))
            .unwrap_or_else(|| self.config.retry_policy());
        if let Some(last) = snapshot.latest_terminal(node_name) {
            let exhausted = snapshot.attempt_count(node_name) >= policy.max_attempts;
            if exhausted
                && matches!(
                    last.state,
                    ComputationState::Failed | ComputationState::Abandoned
                )
            {
                return EngineError::Unreachable {
                    node_name: node_name.to_string(),
                    last_error: last.error.clone(),
                };
            }
        }
        EngineError::WaitTimeout {
            node_name: node_name.to_string(),
        }
    }

    /// Snapshot of all currently-set values, system nodes included.
    #[instrument(skip(self), err)]
    pub async fn values(
        &self,
        execution_id: &str,
    ) -> Result<FxHashMap<String, Value>, EngineError> {
        let snapshot = self.store.load_execution(execution_id).await?;
        Ok(snapshot.set_values())
    }

    /// Fresh read-through of the execution row.
    #[instrument(skip(self), err)]
    pub async fn load(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        let snapshot = self.store.load_execution(execution_id).await?;
        Ok(snapshot.execution)
    }

    /// Full snapshot: execution row, node instances, computation history.
    pub async fn load_snapshot(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionSnapshot, EngineError> {
        Ok(self.store.load_execution(execution_id).await?)
    }

    /// Archive an execution; every further mutation fails with
    /// `ExecutionArchived`. In-flight user functions are not force-killed;
    /// their completions fail at commit time.
    #[instrument(skip(self), err)]
    pub async fn archive(&self, execution_id: &str) -> Result<i64, EngineError> {
        Ok(self.store.archive_execution(execution_id).await?)
    }

    /// Run one sweep tick immediately (test and operational hook).
    pub async fn sweep_now(&self) -> Result<SweepReport, EngineError> {
        Ok(self.sweeper.tick().await?)
    }

    /// Human-readable summary of an execution's state.
    pub async fn summarize(&self, execution_id: &str) -> Result<String, EngineError> {
        let snapshot = self.store.load_execution(execution_id).await?;
        let graph = self.registry.lookup(&snapshot.execution.graph)?;
        let audit = self.store.audit_log(execution_id).await?;
        Ok(diagnostics::summarize(&graph, &snapshot, &audit))
    }

    /// Computations that have not yet succeeded, with their satisfied and
    /// unsatisfied conditions.
    pub async fn outstanding_computations(
        &self,
        execution_id: &str,
    ) -> Result<Vec<OutstandingComputation>, EngineError> {
        let snapshot = self.store.load_execution(execution_id).await?;
        let graph = self.registry.lookup(&snapshot.execution.graph)?;
        Ok(diagnostics::outstanding_computations(
            &graph,
            &snapshot,
            unix_now(),
        ))
    }

    /// Stop the sweeper and drain the worker pool. Idempotent.
    pub async fn shutdown(&self) {
        let handle = self
            .sweeper_handle
            .lock()
            .expect("sweeper handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.dispatcher.shutdown().await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("workers", &self.config.worker_pool_size)
            .finish()
    }
}
