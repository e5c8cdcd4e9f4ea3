//! Background sweeper.
//!
//! A periodic task closing the loop against wall-clock time. Each tick:
//!
//! 1. **Reclaim** — every `computing` attempt past its deadline becomes
//!    `abandoned` (with a revision bump), making its node a candidate
//!    again.
//! 2. **Nudge** — every live execution is re-enqueued for a readiness
//!    pass. This both fires due schedule nodes (the evaluator is
//!    time-aware) and rebuilds dispatch state lost to a crash.
//!
//! Sweep frequency is orthogonal to correctness: the sweeper only
//! accelerates progress, the store's transactions are the safety boundary.
//! Tests drive [`Sweeper::tick`] directly instead of waiting for the
//! interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::event_bus::{RevisionBus, RevisionEvent};
use crate::store::{Store, StoreError};
use crate::utils::time::unix_now;

use super::dispatcher::WorkQueue;

const LIST_PAGE_SIZE: u32 = 256;

/// What one sweep tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Past-deadline attempts transitioned to `abandoned`.
    pub reclaimed: usize,
    /// Live executions re-enqueued for readiness evaluation.
    pub nudged: usize,
}

/// The sweeping logic, independent of the periodic task that drives it.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn Store>,
    bus: RevisionBus,
    queue: WorkQueue,
}

impl Sweeper {
    pub(crate) fn new(store: Arc<dyn Store>, bus: RevisionBus, queue: WorkQueue) -> Self {
        Self { store, bus, queue }
    }

    /// Run one sweep: reclaim abandoned attempts, then nudge every live
    /// execution.
    #[instrument(skip(self), err)]
    pub async fn tick(&self) -> Result<SweepReport, StoreError> {
        let now = unix_now();

        let reclaimed = self.store.reclaim_abandoned(now).await?;
        for attempt in &reclaimed {
            debug!(
                execution_id = %attempt.execution_id,
                node = %attempt.node_name,
                "reclaimed abandoned attempt"
            );
            self.bus.publish(RevisionEvent::new(
                attempt.execution_id.clone(),
                attempt.revision,
                None,
            ));
        }

        let mut nudged = 0;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .list_live_executions(cursor.clone(), LIST_PAGE_SIZE)
                .await?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().cloned();
            for execution_id in page {
                self.queue.nudge(&execution_id);
                nudged += 1;
            }
        }

        Ok(SweepReport {
            reclaimed: reclaimed.len(),
            nudged,
        })
    }

    /// Spawn the periodic task. The first tick fires immediately, which is
    /// the crash-recovery path on process start.
    pub(crate) fn spawn(self, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "sweep tick failed");
                        }
                    }
                }
            }
        });
        SweeperHandle {
            shutdown_tx,
            handle,
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper").finish()
    }
}

/// Shutdown handle for the periodic sweep task.
pub struct SweeperHandle {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}
