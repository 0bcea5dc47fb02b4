//! In-process event bus
//!
//! Topic-based publish/subscribe used to decouple the queue, scheduler,
//! state machine, and sessions. Delivery is at-most-once and ordered per
//! (producer, topic, subscriber). Every subscriber owns a bounded ring;
//! when it overflows the oldest events are dropped and the drop is surfaced
//! as an `event_bus_drop` meta-event so operators can see back-pressure.

use crate::config::BusCapacity;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Topics used by the core
pub mod topic {
    /// All queue transitions
    pub const TASKS: &str = "tasks";
    /// Agent connect/disconnect/state
    pub const PRESENCE: &str = "presence";
    /// Endpoint availability changes
    pub const ROUTING: &str = "routing";
    /// Bus meta-events: drops, mailbox watermarks, corruption
    pub const BUS: &str = "bus";
}

/// Event names published by the core
pub mod event {
    pub const TASK_SUBMITTED: &str = "task_submitted";
    pub const TASK_ASSIGNED: &str = "task_assigned";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const TASK_RETRIED: &str = "task_retried";
    pub const TASK_DEAD_LETTER: &str = "task_dead_letter";
    pub const TASK_RECLAIMED: &str = "task_reclaimed";
    pub const TASK_EXPIRED: &str = "task_expired";
    pub const TASK_ACCEPT: &str = "task_accept";
    pub const AGENT_JOINED: &str = "agent_joined";
    pub const AGENT_LEFT: &str = "agent_left";
    pub const AGENT_IDLE: &str = "agent_idle";
    pub const ENDPOINT_CHANGED: &str = "endpoint_changed";
    pub const EVENT_BUS_DROP: &str = "event_bus_drop";
    pub const ACTOR_MAILBOX_HIGH: &str = "actor_mailbox_high";
    pub const TABLE_CORRUPTED: &str = "table_corrupted";
    pub const CONFIG_CHANGED: &str = "config_changed";
}

/// One published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

struct BusInner {
    topics: DashMap<String, broadcast::Sender<BusEvent>>,
    capacity: usize,
}

/// Process-local multi-producer multi-consumer pub/sub registry
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates a bus whose per-subscriber rings hold `capacity` events
    #[must_use]
    pub fn new(capacity: BusCapacity) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                capacity: capacity.as_usize(),
            }),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusEvent> {
        self.inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }

    /// Publishes an event to all current subscribers of `topic`.
    /// Returns the number of subscribers the event was offered to.
    pub fn publish(&self, topic: &str, event: &str, payload: Value) -> usize {
        let bus_event = BusEvent {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        };
        debug!(topic, event, "bus publish");
        // A send error only means no subscriber is currently listening.
        self.sender(topic).send(bus_event).unwrap_or(0)
    }

    /// Subscribes to a topic. Events published after this call are
    /// delivered; there is no replay.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> Subscription {
        Subscription {
            topic: topic.to_string(),
            rx: self.sender(topic).subscribe(),
            bus: self.clone(),
        }
    }

    fn report_drop(&self, topic: &str, dropped: u64) {
        warn!(topic, dropped, "event bus overflow, oldest events dropped");
        if topic != topic::BUS {
            self.publish(
                topic::BUS,
                event::EVENT_BUS_DROP,
                json!({ "topic": topic, "dropped": dropped }),
            );
        }
    }
}

/// One subscriber's handle on a topic
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<BusEvent>,
    bus: EventBus,
}

impl Subscription {
    /// Waits for the next event. Returns `None` only if the bus itself has
    /// been torn down. Overflow drops are reported and skipped.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.bus.report_drop(&self.topic, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive used for trigger coalescing
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.bus.report_drop(&self.topic, n);
                }
                Err(_) => return None,
            }
        }
    }
}
