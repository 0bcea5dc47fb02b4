//! Session registry and assignment push relay
//!
//! At most one live session per agent id. Registering under an id that is
//! already held returns the prior sender so the caller can supersede it.
//! The push relay subscribes to queue events and forwards `task_assign`
//! pushes to the owning session, keeping the queue decoupled from the
//! transport.

use crate::domain_types::AgentId;
use crate::events::{EventBus, event, topic};
use crate::queue::Task;
use crate::session::protocol::OutboundFrame;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hub-side commands delivered to a session actor
#[derive(Debug)]
pub enum SessionCommand {
    /// Relay a frame to the peer
    Push(OutboundFrame),
    /// A newer session took this agent id; stand down without touching
    /// shared state
    Superseded,
    /// Hub shutdown
    Close,
}

/// Address of one live session
#[derive(Clone)]
pub struct SessionSender {
    session_id: Uuid,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionSender {
    /// Binds a command channel to a session id
    #[must_use]
    pub fn new(session_id: Uuid, tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { session_id, tx }
    }

    /// The owning session's id
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Non-blocking send; false when the session is gone or saturated
    pub fn send(&self, command: SessionCommand) -> bool {
        self.tx.try_send(command).is_ok()
    }
}

/// Live sessions keyed by agent id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<DashMap<AgentId, SessionSender>>,
}

impl SessionRegistry {
    /// Fresh empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `sender` as the live session for `agent_id`, returning any
    /// superseded prior session.
    pub fn register(&self, agent_id: AgentId, sender: SessionSender) -> Option<SessionSender> {
        self.inner.insert(agent_id, sender)
    }

    /// Removes the entry only if `session_id` still owns it; a superseded
    /// session must not evict its replacement.
    pub fn deregister(&self, agent_id: &AgentId, session_id: Uuid) -> bool {
        self.inner
            .remove_if(agent_id, |_, sender| sender.session_id() == session_id)
            .is_some()
    }

    /// The live session for an agent, if any
    #[must_use]
    pub fn get(&self, agent_id: &AgentId) -> Option<SessionSender> {
        self.inner.get(agent_id).map(|entry| entry.clone())
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Tells every live session to close (hub shutdown)
    pub fn close_all(&self) {
        for entry in self.inner.iter() {
            entry.value().send(SessionCommand::Close);
        }
    }
}

/// Forwards `task_assigned` events to the owning session as `task_assign`
/// pushes. Runs until the bus closes.
pub fn spawn_push_relay(bus: &EventBus, registry: SessionRegistry) -> JoinHandle<()> {
    let mut sub = bus.subscribe(topic::TASKS);
    tokio::spawn(async move {
        while let Some(ev) = sub.recv().await {
            if ev.event != event::TASK_ASSIGNED {
                continue;
            }
            let Some(agent_id) = ev
                .payload
                .get("agent_id")
                .and_then(|v| v.as_str())
                .and_then(|s| AgentId::try_new(s.to_string()).ok())
            else {
                continue;
            };
            let Some(task) = ev
                .payload
                .get("task")
                .and_then(|v| serde_json::from_value::<Task>(v.clone()).ok())
            else {
                warn!(agent_id = %agent_id, "assignment event without task payload");
                continue;
            };

            match registry.get(&agent_id) {
                Some(sender) => {
                    if !sender.send(SessionCommand::Push(OutboundFrame::assign(&task))) {
                        warn!(agent_id = %agent_id, task_id = %task.id, "push to session failed");
                    }
                }
                // Accept timeout will reclaim if the agent never shows up.
                None => debug!(agent_id = %agent_id, task_id = %task.id, "no live session for push"),
            }
        }
    })
}
