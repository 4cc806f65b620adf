//! Named synchronous publish/subscribe for lifecycle signals
//!
//! The bus decouples lifecycle events (spawn complete, quitting, reporting
//! tick) from their consumers. Handlers run in registration order on the
//! publisher's context, so they must be short and non-blocking; long work
//! belongs on its own task.

use std::collections::HashMap;
use std::sync::RwLock;

/// A spawn cycle has started.
pub const EVENT_SPAWN: &str = "boomer:spawn";
/// Legacy alias of [`EVENT_SPAWN`]; both names deliver to subscribers of
/// either, because existing user code may subscribe by the older name.
pub const EVENT_HATCH: &str = "boomer:hatch";
/// All requested workers are up.
pub const EVENT_SPAWN_COMPLETE: &str = "boomer:spawn-complete";
/// The worker pool is being stopped.
pub const EVENT_STOP: &str = "boomer:stop";
/// The process is shutting down.
pub const EVENT_QUIT: &str = "boomer:quit";
/// A report window is about to be sent to the master.
pub const EVENT_REPORT_TO_MASTER: &str = "boomer:report-to-master";

/// Payload delivered with an event. Spawn events carry their target; other
/// topics publish the empty payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPayload {
    /// Target active user count of a spawn cycle.
    pub user_count: Option<u64>,
    /// Users per second of a smooth spawn cycle.
    pub spawn_rate: Option<f64>,
}

impl EventPayload {
    /// Payload for a spawn cycle.
    pub fn spawn(user_count: u64, spawn_rate: f64) -> Self {
        Self {
            user_count: Some(user_count),
            spawn_rate: Some(spawn_rate),
        }
    }
}

type Handler = Box<dyn Fn(&EventPayload) + Send + Sync>;

/// Named in-process pub/sub registry.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. Handlers for one topic fire in
    /// registration order.
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        let mut handlers = match self.handlers.write() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers
            .entry(topic.to_owned())
            .or_default()
            .push(Box::new(handler));
    }

    /// Publish `topic` with the empty payload.
    pub fn publish(&self, topic: &str) {
        self.publish_with(topic, &EventPayload::default());
    }

    /// Publish `topic` with `payload`, delivering to subscribers of the
    /// topic and of its legacy alias, if any.
    pub fn publish_with(&self, topic: &str, payload: &EventPayload) {
        let handlers = match self.handlers.read() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        for name in [Some(topic), alias_of(topic)].into_iter().flatten() {
            if let Some(subscribers) = handlers.get(name) {
                for handler in subscribers {
                    handler(payload);
                }
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = match self.handlers.read() {
            Ok(h) => h.len(),
            Err(_) => 0,
        };
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

fn alias_of(topic: &str) -> Option<&'static str> {
    match topic {
        EVENT_SPAWN => Some(EVENT_HATCH),
        EVENT_HATCH => Some(EVENT_SPAWN),
        _ => None,
    }
}
