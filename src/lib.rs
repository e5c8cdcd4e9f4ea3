//! ```text
//! GraphBuilder ─► GraphRegistry ─► Engine
//!                                  │
//!                                  ├─► Dispatcher ─► ready() ─► NodeFn
//!                                  │        │                    │
//!                                  │        └──── Store (claim / complete / revision)
//!                                  │                    │
//!                                  ├─► Sweeper ─────────┘  (reclaim + nudge)
//!                                  │
//!                                  └─► RevisionBus ─► wait_any / wait_new
//! ```
//!
//! Trellis is a persistent dataflow execution engine. Users declare a
//! graph of named nodes — inputs, computes, schedules, mutators — whose
//! dependencies are value-level predicates over other nodes. Starting an
//! execution creates a durable record; setting input values triggers
//! computations whose conditions become satisfied. Results are persisted,
//! versioned by a monotonic per-execution revision, and recomputation
//! cascades when upstream values change.
//!
//! Safety relies on the store's transactions, not on in-process state: at
//! most one attempt per `(execution, node)` is in flight at a time, every
//! durable mutation bumps the execution revision by exactly one, and a
//! background sweeper reclaims attempts orphaned by crashes.

pub mod diagnostics;
pub mod event_bus;
pub mod graphs;
pub mod node;
pub mod runtimes;
pub mod schedulers;
pub mod store;
pub mod types;
pub mod utils;
