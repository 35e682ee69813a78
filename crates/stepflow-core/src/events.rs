//! Lifecycle event bus
//!
//! In-process publish/subscribe for the engine's externally observable
//! events. Emission is synchronous and best-effort: subscribers run in
//! registration order on the emitting task, and a panicking subscriber is
//! isolated so the remaining subscribers still see the event.
//!
//! Ordering contract: events for one execution are emitted in the order its
//! worker produced them; `execution:updated` fires after every persisted
//! transition and is the preferred synchronization point for observers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::execution::ExecutionStatus;

/// Externally observable engine events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    /// Startup handshake with both stores completed.
    #[serde(rename = "ready")]
    Ready,

    /// A store failure during engine bookkeeping.
    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "execution:start")]
    ExecutionStart {
        execution_id: String,
        event_name: String,
        attempt_count: u32,
    },

    /// Emitted after both store writes for the terminal state settle.
    #[serde(rename = "execution:complete")]
    ExecutionComplete { execution_id: String, result: Value },

    #[serde(rename = "execution:failed")]
    ExecutionFailed {
        execution_id: String,
        error: String,
        attempt_count: u32,
        will_retry: bool,
    },

    /// Emitted after every terminal or transitional persistence.
    #[serde(rename = "execution:updated")]
    ExecutionUpdated {
        execution_id: String,
        status: ExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt_count: Option<u32>,
    },

    #[serde(rename = "step:complete")]
    StepComplete {
        execution_id: String,
        step_name: String,
    },

    #[serde(rename = "leader:acquired")]
    LeaderAcquired,

    #[serde(rename = "leader:lost")]
    LeaderLost,

    #[serde(rename = "schedule:registered")]
    ScheduleRegistered { function_id: String },

    #[serde(rename = "schedule:triggered")]
    ScheduleTriggered {
        function_id: String,
        execution_id: String,
        timestamp: i64,
        is_missed: bool,
    },

    #[serde(rename = "schedule:missed")]
    ScheduleMissed { function_id: String },

    #[serde(rename = "stopped")]
    Stopped,
}

type Subscriber = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Explicit subscriber list shared by clonable handle.
///
/// Cloning the bus yields another handle onto the same subscriber list, so
/// the client, worker pool and scheduler of one deployment can share it.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Subscribers run synchronously on the emitting
    /// task; keep them fast and non-blocking.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(subscriber));
    }

    /// Emit an event to every subscriber.
    pub fn emit(&self, event: LifecycleEvent) {
        // Snapshot outside the lock so a subscriber may itself subscribe.
        let subscribers: Vec<Subscriber> = self.subscribers.read().clone();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                warn!(event = ?event, "event subscriber panicked, continuing emission");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_to_all_subscribers_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(RwLock::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.write().push(tag));
        }

        bus.emit(LifecycleEvent::Ready);
        assert_eq!(*seen.read(), vec!["a", "b"]);
    }

    #[test]
    fn panicking_subscriber_does_not_abort_emission() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("bad subscriber"));
        {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.emit(LifecycleEvent::Stopped);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_serialize_with_wire_type_tags() {
        let event = LifecycleEvent::ExecutionStart {
            execution_id: "e1".into(),
            event_name: "simple-event".into(),
            attempt_count: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution:start");
        assert_eq!(json["execution_id"], "e1");

        let json = serde_json::to_value(LifecycleEvent::LeaderAcquired).unwrap();
        assert_eq!(json["type"], "leader:acquired");
    }

    #[test]
    fn clones_share_one_subscriber_list() {
        let bus = EventBus::new();
        let clone = bus.clone();
        clone.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
    }
}
