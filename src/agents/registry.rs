//! Agent state machine actor
//!
//! Tracks every agent that has ever connected, serializes all FSM
//! transitions, arms the acceptance timeout per assignment, and reaps
//! agents whose heartbeats have gone stale. Disconnects reclaim any held
//! task through the queue handle; the scheduler only ever observes agents
//! through `list_all`/`get_state` snapshots and presence events.

use crate::agents::fsm::{AgentRecord, AgentState, FsmError};
use crate::config::{HubConfig, MAILBOX_HIGH_WATERMARK};
use crate::domain_types::{AgentId, CapabilityName, EpochMillis, TaskId};
use crate::events::{EventBus, event, topic};
use crate::queue::{QueueError, TaskQueueHandle};
use serde_json::json;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

enum Command {
    Connect {
        agent_id: AgentId,
        capabilities: HashSet<CapabilityName>,
        endpoint_host: Option<String>,
    },
    Disconnect {
        agent_id: AgentId,
    },
    Assign {
        agent_id: AgentId,
        task_id: TaskId,
        reply: oneshot::Sender<Result<(), FsmError>>,
    },
    Accept {
        agent_id: AgentId,
        task_id: TaskId,
        reply: oneshot::Sender<Result<(), FsmError>>,
    },
    Reject {
        agent_id: AgentId,
        task_id: TaskId,
        reason: String,
        reply: oneshot::Sender<Result<(), FsmError>>,
    },
    Finish {
        agent_id: AgentId,
        task_id: TaskId,
        blocked: bool,
        reply: oneshot::Sender<Result<(), FsmError>>,
    },
    Block {
        agent_id: AgentId,
        reply: oneshot::Sender<Result<(), FsmError>>,
    },
    Unblock {
        agent_id: AgentId,
        reply: oneshot::Sender<Result<(), FsmError>>,
    },
    Resume {
        agent_id: AgentId,
        task_id: TaskId,
        reply: oneshot::Sender<Result<(), FsmError>>,
    },
    Heartbeat {
        agent_id: AgentId,
    },
    ListAll {
        reply: oneshot::Sender<Vec<AgentRecord>>,
    },
    GetState {
        agent_id: AgentId,
        reply: oneshot::Sender<Result<AgentRecord, FsmError>>,
    },
    AcceptTimeout {
        agent_id: AgentId,
        task_id: TaskId,
        deadline: EpochMillis,
    },
    ReaperTick,
}

/// Cloneable handle on the agent state machine actor
#[derive(Clone)]
pub struct AgentFsmHandle {
    tx: mpsc::Sender<Command>,
}

impl AgentFsmHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, FsmError>>) -> Command,
    ) -> Result<T, FsmError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| FsmError::Closed)?;
        rx.await.map_err(|_| FsmError::Closed)?
    }

    fn cast(&self, command: Command) {
        if self.tx.try_send(command).is_err() {
            warn!("agent fsm cast dropped, mailbox full or closed");
        }
    }

    /// Agent connected (or reconnected); enters `idle`
    pub async fn connect(
        &self,
        agent_id: AgentId,
        capabilities: HashSet<CapabilityName>,
        endpoint_host: Option<String>,
    ) {
        let _ = self
            .tx
            .send(Command::Connect {
                agent_id,
                capabilities,
                endpoint_host,
            })
            .await;
    }

    /// Connection closed; any held task is reclaimed
    pub async fn disconnect(&self, agent_id: AgentId) {
        let _ = self.tx.send(Command::Disconnect { agent_id }).await;
    }

    /// `idle -> assigned`, arming the acceptance timeout
    ///
    /// # Errors
    /// `FsmError` if the agent is unknown or not idle.
    pub async fn assign(&self, agent_id: AgentId, task_id: TaskId) -> Result<(), FsmError> {
        self.call(|reply| Command::Assign {
            agent_id,
            task_id,
            reply,
        })
        .await
    }

    /// `assigned -> working` on `task_accepted`
    ///
    /// # Errors
    /// `FsmError` on state or task mismatch.
    pub async fn accept(&self, agent_id: AgentId, task_id: TaskId) -> Result<(), FsmError> {
        self.call(|reply| Command::Accept {
            agent_id,
            task_id,
            reply,
        })
        .await
    }

    /// `assigned -> idle`; the task is reclaimed for rescheduling
    ///
    /// # Errors
    /// `FsmError` on state or task mismatch.
    pub async fn reject(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        reason: &str,
    ) -> Result<(), FsmError> {
        self.call(|reply| Command::Reject {
            agent_id,
            task_id,
            reason: reason.to_string(),
            reply,
        })
        .await
    }

    /// `working -> idle | blocked` after completion or failure
    ///
    /// # Errors
    /// `FsmError` on state or task mismatch.
    pub async fn finish(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        blocked: bool,
    ) -> Result<(), FsmError> {
        self.call(|reply| Command::Finish {
            agent_id,
            task_id,
            blocked,
            reply,
        })
        .await
    }

    /// Declares the agent blocked on external input
    ///
    /// # Errors
    /// `FsmError` when the agent is unknown or offline.
    pub async fn block(&self, agent_id: AgentId) -> Result<(), FsmError> {
        self.call(|reply| Command::Block { agent_id, reply }).await
    }

    /// Clears a blocked declaration
    ///
    /// # Errors
    /// `FsmError` when the agent is not blocked.
    pub async fn unblock(&self, agent_id: AgentId) -> Result<(), FsmError> {
        self.call(|reply| Command::Unblock { agent_id, reply })
            .await
    }

    /// Reconnect recovery into `working` without reassignment
    ///
    /// # Errors
    /// `FsmError` when the agent cannot resume.
    pub async fn resume(&self, agent_id: AgentId, task_id: TaskId) -> Result<(), FsmError> {
        self.call(|reply| Command::Resume {
            agent_id,
            task_id,
            reply,
        })
        .await
    }

    /// Liveness signal consumed by the reaper
    pub fn heartbeat(&self, agent_id: AgentId) {
        self.cast(Command::Heartbeat { agent_id });
    }

    /// Snapshot of every tracked agent
    ///
    /// # Errors
    /// `FsmError::Closed` if the actor is gone.
    pub async fn list_all(&self) -> Result<Vec<AgentRecord>, FsmError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ListAll { reply })
            .await
            .map_err(|_| FsmError::Closed)?;
        rx.await.map_err(|_| FsmError::Closed)
    }

    /// Snapshot of one agent
    ///
    /// # Errors
    /// `FsmError::UnknownAgent` when never connected.
    pub async fn get_state(&self, agent_id: AgentId) -> Result<AgentRecord, FsmError> {
        self.call(|reply| Command::GetState { agent_id, reply })
            .await
    }
}

/// The agent state machine component
pub struct AgentFsm;

impl AgentFsm {
    /// Spawns the state machine actor
    #[must_use]
    pub fn spawn(bus: EventBus, queue: TaskQueueHandle, config: &HubConfig) -> AgentFsmHandle {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.as_usize());
        let actor = FsmActor {
            agents: HashMap::new(),
            bus,
            queue,
            accept_timeout_ms: config.acceptance_timeout_ms.as_u64(),
            stale_after_ms: config.agent_stale_after_ms,
            own_tx: tx.clone(),
            mailbox_high: false,
        };
        tokio::spawn(actor.run(rx));
        AgentFsmHandle { tx }
    }
}

struct FsmActor {
    agents: HashMap<AgentId, AgentRecord>,
    bus: EventBus,
    queue: TaskQueueHandle,
    accept_timeout_ms: u64,
    stale_after_ms: u64,
    own_tx: mpsc::Sender<Command>,
    mailbox_high: bool,
}

impl FsmActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut reaper =
            tokio::time::interval(Duration::from_millis((self.stale_after_ms / 2).max(1_000)));
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        reaper.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.watch_mailbox(&rx);
                    self.handle(command).await;
                }
                _ = reaper.tick() => {
                    self.handle(Command::ReaperTick).await;
                }
            }
        }
        debug!("agent fsm actor stopped");
    }

    fn watch_mailbox(&mut self, rx: &mpsc::Receiver<Command>) {
        let depth = rx.len();
        if depth > MAILBOX_HIGH_WATERMARK && !self.mailbox_high {
            self.mailbox_high = true;
            self.bus.publish(
                topic::BUS,
                event::ACTOR_MAILBOX_HIGH,
                json!({ "actor": "agent_fsm", "depth": depth }),
            );
        } else if depth < MAILBOX_HIGH_WATERMARK / 2 {
            self.mailbox_high = false;
        }
    }

    fn record_mut(&mut self, agent_id: &AgentId) -> Result<&mut AgentRecord, FsmError> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| FsmError::UnknownAgent {
                agent_id: agent_id.clone(),
            })
    }

    fn publish_idle(&self, agent_id: &AgentId) {
        self.bus.publish(
            topic::PRESENCE,
            event::AGENT_IDLE,
            json!({ "agent_id": agent_id }),
        );
    }

    async fn reclaim_held(&self, task_id: TaskId, reason: &str) {
        match self.queue.reclaim_task(task_id, reason).await {
            Ok(_) => {}
            // The queue may have already moved the task on; both are fine.
            Err(QueueError::NotAssigned { .. } | QueueError::NotFound { .. }) => {}
            Err(e) => warn!(%task_id, %e, "reclaim on {reason} failed"),
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect {
                agent_id,
                capabilities,
                endpoint_host,
            } => {
                self.connect(agent_id, capabilities, endpoint_host);
            }
            Command::Disconnect { agent_id } => {
                self.disconnect(agent_id).await;
            }
            Command::Assign {
                agent_id,
                task_id,
                reply,
            } => {
                let _ = reply.send(self.assign(agent_id, task_id));
            }
            Command::Accept {
                agent_id,
                task_id,
                reply,
            } => {
                let result = self
                    .record_mut(&agent_id)
                    .and_then(|rec| rec.accept(task_id));
                let _ = reply.send(result);
            }
            Command::Reject {
                agent_id,
                task_id,
                reason,
                reply,
            } => {
                let result = self
                    .record_mut(&agent_id)
                    .and_then(|rec| rec.reject(task_id));
                if result.is_ok() {
                    self.reclaim_held(task_id, &format!("rejected: {reason}"))
                        .await;
                    self.publish_idle(&agent_id);
                }
                let _ = reply.send(result);
            }
            Command::Finish {
                agent_id,
                task_id,
                blocked,
                reply,
            } => {
                let result = self
                    .record_mut(&agent_id)
                    .and_then(|rec| rec.finish(task_id, blocked));
                if result.is_ok() && !blocked {
                    self.publish_idle(&agent_id);
                }
                let _ = reply.send(result);
            }
            Command::Block { agent_id, reply } => {
                let _ = reply.send(self.record_mut(&agent_id).and_then(AgentRecord::block));
            }
            Command::Unblock { agent_id, reply } => {
                let result = self.record_mut(&agent_id).and_then(AgentRecord::unblock);
                if result.is_ok() {
                    self.publish_idle(&agent_id);
                }
                let _ = reply.send(result);
            }
            Command::Resume {
                agent_id,
                task_id,
                reply,
            } => {
                let result = self
                    .record_mut(&agent_id)
                    .and_then(|rec| rec.resume(task_id));
                let _ = reply.send(result);
            }
            Command::Heartbeat { agent_id } => {
                if let Some(rec) = self.agents.get_mut(&agent_id) {
                    rec.last_heartbeat = EpochMillis::now();
                }
            }
            Command::ListAll { reply } => {
                let _ = reply.send(self.agents.values().cloned().collect());
            }
            Command::GetState { agent_id, reply } => {
                let result = self
                    .agents
                    .get(&agent_id)
                    .cloned()
                    .ok_or(FsmError::UnknownAgent { agent_id });
                let _ = reply.send(result);
            }
            Command::AcceptTimeout {
                agent_id,
                task_id,
                deadline,
            } => {
                self.accept_timeout(agent_id, task_id, deadline).await;
            }
            Command::ReaperTick => {
                self.reap_stale().await;
            }
        }
    }

    fn connect(
        &mut self,
        agent_id: AgentId,
        capabilities: HashSet<CapabilityName>,
        endpoint_host: Option<String>,
    ) {
        match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().reconnect(capabilities, endpoint_host);
            }
            Entry::Vacant(slot) => {
                slot.insert(AgentRecord::connected(
                    agent_id.clone(),
                    capabilities,
                    endpoint_host,
                ));
            }
        }
        info!(agent_id = %agent_id, "agent connected");
        self.bus.publish(
            topic::PRESENCE,
            event::AGENT_JOINED,
            json!({ "agent_id": agent_id }),
        );
    }

    async fn disconnect(&mut self, agent_id: AgentId) {
        let Some(rec) = self.agents.get_mut(&agent_id) else {
            return;
        };
        if rec.fsm_state == AgentState::Offline {
            return;
        }
        let held = rec.go_offline();
        info!(agent_id = %agent_id, held_task = ?held, "agent disconnected");

        if let Some(task_id) = held {
            self.reclaim_held(task_id, "disconnect").await;
        }
        self.bus.publish(
            topic::PRESENCE,
            event::AGENT_LEFT,
            json!({ "agent_id": agent_id }),
        );
    }

    fn assign(&mut self, agent_id: AgentId, task_id: TaskId) -> Result<(), FsmError> {
        let deadline = EpochMillis::now().plus(self.accept_timeout_ms);
        self.record_mut(&agent_id)?.assign(task_id, deadline)?;

        // The timer message carries its deadline; the handler re-validates
        // against current state before acting.
        let tx = self.own_tx.clone();
        let timeout = Duration::from_millis(self.accept_timeout_ms);
        let timer_agent = agent_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx
                .send(Command::AcceptTimeout {
                    agent_id: timer_agent,
                    task_id,
                    deadline,
                })
                .await;
        });
        Ok(())
    }

    async fn accept_timeout(&mut self, agent_id: AgentId, task_id: TaskId, deadline: EpochMillis) {
        let Some(rec) = self.agents.get_mut(&agent_id) else {
            return;
        };
        // Only act if the state this timer was defending still holds.
        if rec.fsm_state != AgentState::Assigned
            || rec.current_task_id != Some(task_id)
            || rec.accept_deadline != Some(deadline)
        {
            return;
        }

        warn!(agent_id = %agent_id, %task_id, "acceptance timeout, reclaiming");
        rec.accept_timed_out();
        self.reclaim_held(task_id, "accept_timeout").await;
        self.publish_idle(&agent_id);
    }

    async fn reap_stale(&mut self) {
        let now = EpochMillis::now();
        let stale: Vec<AgentId> = self
            .agents
            .values()
            .filter(|rec| {
                rec.fsm_state != AgentState::Offline
                    && rec.last_heartbeat.elapsed_until(now) > self.stale_after_ms
            })
            .map(|rec| rec.agent_id.clone())
            .collect();

        for agent_id in stale {
            warn!(agent_id = %agent_id, "reaping stale agent");
            self.disconnect(agent_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusCapacity;
    use crate::queue::{SubmitParams, TaskQueue, TaskStatus};
    use crate::storage::Database;

    async fn fixture() -> (AgentFsmHandle, TaskQueueHandle, EventBus) {
        let db = Database::open_in_memory().await.unwrap();
        let bus = EventBus::new(BusCapacity::try_new(256).unwrap());
        let queue = TaskQueue::spawn(&db, bus.clone(), &HubConfig::default())
            .await
            .unwrap();
        let fsm = AgentFsm::spawn(bus.clone(), queue.clone(), &HubConfig::default());
        (fsm, queue, bus)
    }

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    #[tokio::test]
    async fn connect_assign_accept_finish() {
        let (fsm, _queue, _bus) = fixture().await;
        let a = agent("a1");
        fsm.connect(a.clone(), HashSet::new(), None).await;

        let task = TaskId::generate();
        fsm.assign(a.clone(), task).await.unwrap();
        assert_eq!(
            fsm.get_state(a.clone()).await.unwrap().fsm_state,
            AgentState::Assigned
        );

        fsm.accept(a.clone(), task).await.unwrap();
        fsm.finish(a.clone(), task, false).await.unwrap();
        let rec = fsm.get_state(a).await.unwrap();
        assert_eq!(rec.fsm_state, AgentState::Idle);
        assert_eq!(rec.current_task_id, None);
    }

    #[tokio::test]
    async fn disconnect_mid_work_reclaims_task() {
        let (fsm, queue, _bus) = fixture().await;
        let a = agent("a1");
        fsm.connect(a.clone(), HashSet::new(), None).await;

        let task = queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();
        let assigned = queue.assign_task(task.id, a.clone(), None).await.unwrap();
        fsm.assign(a.clone(), task.id).await.unwrap();
        fsm.accept(a.clone(), task.id).await.unwrap();

        fsm.disconnect(a.clone()).await;

        let rec = fsm.get_state(a).await.unwrap();
        assert_eq!(rec.fsm_state, AgentState::Offline);

        let reclaimed = queue.get(task.id).await.unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Queued);
        assert!(reclaimed.generation > assigned.generation);
    }

    #[tokio::test]
    async fn acceptance_timeout_reclaims_and_flags() {
        let db = Database::open_in_memory().await.unwrap();
        let bus = EventBus::new(BusCapacity::try_new(256).unwrap());
        let mut config = HubConfig::default();
        config.acceptance_timeout_ms =
            crate::config::AcceptanceTimeoutMs::try_new(1_000).unwrap();
        let queue = TaskQueue::spawn(&db, bus.clone(), &config).await.unwrap();
        let fsm = AgentFsm::spawn(bus.clone(), queue.clone(), &config);

        let a = agent("slow");
        fsm.connect(a.clone(), HashSet::new(), None).await;
        let task = queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();
        queue.assign_task(task.id, a.clone(), None).await.unwrap();
        fsm.assign(a.clone(), task.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let rec = fsm.get_state(a).await.unwrap();
        assert_eq!(rec.fsm_state, AgentState::Idle);
        assert!(rec.slow_accept);
        let reclaimed = queue.get(task.id).await.unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Queued);
        assert_eq!(reclaimed.generation.as_u64(), 2);
    }

    #[tokio::test]
    async fn timeout_is_a_noop_after_accept() {
        let (fsm, _queue, _bus) = fixture().await;
        let a = agent("fast");
        fsm.connect(a.clone(), HashSet::new(), None).await;
        let task = TaskId::generate();
        fsm.assign(a.clone(), task).await.unwrap();
        fsm.accept(a.clone(), task).await.unwrap();

        // Deliver a timer for a deadline that no longer matches.
        let rec = fsm.get_state(a.clone()).await.unwrap();
        assert_eq!(rec.fsm_state, AgentState::Working);
        assert!(!rec.slow_accept);
    }

    #[tokio::test]
    async fn reject_returns_task_to_queue() {
        let (fsm, queue, _bus) = fixture().await;
        let a = agent("picky");
        fsm.connect(a.clone(), HashSet::new(), None).await;
        let task = queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();
        queue.assign_task(task.id, a.clone(), None).await.unwrap();
        fsm.assign(a.clone(), task.id).await.unwrap();

        fsm.reject(a.clone(), task.id, "wrong repo").await.unwrap();
        assert_eq!(fsm.get_state(a).await.unwrap().fsm_state, AgentState::Idle);
        assert_eq!(
            queue.get(task.id).await.unwrap().status,
            TaskStatus::Queued
        );
    }
}
