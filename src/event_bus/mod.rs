//! In-process revision notification bus.
//!
//! Every successful gateway write publishes a `(execution_id, revision)`
//! event here; callers parked in `wait_any` / `wait_new` subscribe and
//! re-check the store when woken. The bus is best-effort for liveness
//! only — a missed event costs a sweep interval, never correctness,
//! because the sweeper re-evaluates readiness from the store.

use std::sync::{Arc, Mutex};

use crate::types::Revision;

/// One committed durable mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionEvent {
    pub execution_id: String,
    pub revision: Revision,
    /// The node whose value changed, when the mutation wrote one.
    pub node_name: Option<String>,
}

impl RevisionEvent {
    #[must_use]
    pub fn new(
        execution_id: impl Into<String>,
        revision: Revision,
        node_name: Option<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            revision,
            node_name,
        }
    }
}

struct Subscriber {
    execution_id: String,
    sender: flume::Sender<RevisionEvent>,
}

/// Fan-out notifier for revision changes.
///
/// Cheap to clone; all clones share the subscriber list. Disconnected
/// subscribers are pruned on publish.
#[derive(Clone, Default)]
pub struct RevisionBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl RevisionBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event for one execution.
    ///
    /// Subscribe *before* reading the baseline state you intend to compare
    /// against, so a write racing the subscription is never missed.
    #[must_use]
    pub fn subscribe(&self, execution_id: impl Into<String>) -> flume::Receiver<RevisionEvent> {
        let (sender, receiver) = flume::unbounded();
        self.subscribers
            .lock()
            .expect("bus lock poisoned")
            .push(Subscriber {
                execution_id: execution_id.into(),
                sender,
            });
        receiver
    }

    /// Publish a committed mutation to all matching subscribers.
    pub fn publish(&self, event: RevisionEvent) {
        let mut guard = self.subscribers.lock().expect("bus lock poisoned");
        guard.retain(|sub| {
            if sub.execution_id != event.execution_id {
                return !sub.sender.is_disconnected();
            }
            sub.sender.send(event.clone()).is_ok()
        });
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus lock poisoned").len()
    }
}

impl std::fmt::Debug for RevisionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
