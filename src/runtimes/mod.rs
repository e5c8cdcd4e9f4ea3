//! Runtime infrastructure: the engine, its worker pool, the background
//! sweeper, and configuration.
//!
//! The runtime layer assembles the pure pieces (graphs, readiness
//! evaluation) with the durable pieces (the store gateway) and the
//! liveness pieces (bus, dispatcher, sweeper) into the process-wide
//! [`Engine`].

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod sweeper;

pub use config::EngineConfig;
pub use dispatcher::Dispatcher;
pub use engine::{Engine, EngineError, GetOptions, WaitMode};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
