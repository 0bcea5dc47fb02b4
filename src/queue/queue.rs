//! Task queue actor
//!
//! Owns the canonical state of every task. All mutations funnel through one
//! sequential actor so the status DAG and generation fences hold under
//! concurrency; each mutation is durable before the reply returns, and one
//! post-commit event is published per mutation.

use crate::config::{HubConfig, MAILBOX_HIGH_WATERMARK, MAX_DESCRIPTION_CHARS};
use crate::domain_types::{AgentId, EpochMillis, Generation, RoutingDecision, TaskId, TaskPriority};
use crate::events::{EventBus, event, topic};
use crate::queue::task::{
    CompletionOutcome, FailureOutcome, SubmitParams, Task, TaskStatus, TransitionError,
};
use crate::storage::{Database, KvTable, StorageError, table};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Queue operation errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task not found: {id}")]
    NotFound { id: TaskId },

    #[error("task {id} is {status:?}, operation needs {needs:?}")]
    InvalidState {
        id: TaskId,
        status: TaskStatus,
        needs: TaskStatus,
    },

    #[error("stale generation for task {id}: current {current}, supplied {supplied}")]
    StaleGeneration {
        id: TaskId,
        current: Generation,
        supplied: Generation,
    },

    #[error("task {id} is not assigned")]
    NotAssigned { id: TaskId },

    #[error("invalid params: {reason}")]
    InvalidParams { reason: String },

    #[error("table corrupted: {table}")]
    TableCorrupted { table: String },

    #[error("queue actor is gone")]
    Closed,
}

/// Filter for `list`
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub assigned_to: Option<AgentId>,
}

impl TaskFilter {
    /// Filter on status only
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.priority.is_none_or(|p| task.priority == p)
            && self
                .assigned_to
                .as_ref()
                .is_none_or(|a| task.assigned_to.as_ref() == Some(a))
    }
}

/// Counts grouped by status and priority
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub by_status: BTreeMap<String, u64>,
    pub by_priority: BTreeMap<String, u64>,
    pub dead_letter: u64,
}

/// Reconnect reconciliation verdict
#[derive(Debug, Clone)]
pub enum RecoverOutcome {
    /// Still assigned; the agent may continue under this task's generation
    Continue(Box<Task>),
    /// Reassigned, reclaimed, or terminal; the agent must drop the work
    Reassign,
}

enum Command {
    Submit {
        params: SubmitParams,
        reply: oneshot::Sender<Result<Task, QueueError>>,
    },
    Get {
        id: TaskId,
        reply: oneshot::Sender<Result<Task, QueueError>>,
    },
    List {
        filter: TaskFilter,
        reply: oneshot::Sender<Vec<Task>>,
    },
    DequeueNext {
        reply: oneshot::Sender<Option<Task>>,
    },
    Assign {
        id: TaskId,
        agent: AgentId,
        complete_by: Option<EpochMillis>,
        reply: oneshot::Sender<Result<Task, QueueError>>,
    },
    Complete {
        id: TaskId,
        generation: Generation,
        outcome: CompletionOutcome,
        reply: oneshot::Sender<Result<Task, QueueError>>,
    },
    Fail {
        id: TaskId,
        generation: Generation,
        error: String,
        reply: oneshot::Sender<Result<(FailureOutcome, Task), QueueError>>,
    },
    Progress {
        id: TaskId,
    },
    Recover {
        id: TaskId,
        reply: oneshot::Sender<Result<RecoverOutcome, QueueError>>,
    },
    Reclaim {
        id: TaskId,
        reason: String,
        reply: oneshot::Sender<Result<Task, QueueError>>,
    },
    RetryDeadLetter {
        id: TaskId,
        reply: oneshot::Sender<Result<Task, QueueError>>,
    },
    PurgeDeadLetter {
        id: TaskId,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Expire {
        id: TaskId,
        reply: oneshot::Sender<Result<Option<Task>, QueueError>>,
    },
    StoreRouting {
        id: TaskId,
        decision: RoutingDecision,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
}

/// Cloneable handle on the queue actor
#[derive(Clone)]
pub struct TaskQueueHandle {
    tx: mpsc::Sender<Command>,
}

macro_rules! request {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .tx
            .send(Command::$variant { $($field: $value,)* reply })
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }};
}

impl TaskQueueHandle {
    /// Persists a new task and publishes `task_submitted`
    ///
    /// # Errors
    /// `InvalidParams` on an empty description; `TableCorrupted` on storage
    /// failure.
    pub async fn submit(&self, params: SubmitParams) -> Result<Task, QueueError> {
        request!(self, Submit { params: params })?
    }

    /// Looks up a task in the active store, then dead-letter
    ///
    /// # Errors
    /// `NotFound` if neither store has the id.
    pub async fn get(&self, id: TaskId) -> Result<Task, QueueError> {
        request!(self, Get { id: id })?
    }

    /// Lists tasks matching the filter, ordered by `(priority, created_at)`
    ///
    /// # Errors
    /// `Closed` if the actor is gone.
    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, QueueError> {
        request!(self, List { filter: filter })
    }

    /// Peeks at the highest-priority queued task without mutating
    ///
    /// # Errors
    /// `Closed` if the actor is gone.
    pub async fn dequeue_next(&self) -> Result<Option<Task>, QueueError> {
        request!(self, DequeueNext {})
    }

    /// `queued -> assigned`; bumps the generation and publishes
    /// `task_assigned`
    ///
    /// # Errors
    /// `NotFound`, `InvalidState`, `TableCorrupted`.
    pub async fn assign_task(
        &self,
        id: TaskId,
        agent: AgentId,
        complete_by: Option<EpochMillis>,
    ) -> Result<Task, QueueError> {
        request!(self, Assign { id: id, agent: agent, complete_by: complete_by })?
    }

    /// Fenced completion; publishes `task_completed`
    ///
    /// # Errors
    /// `NotFound`, `InvalidState`, `StaleGeneration`, `TableCorrupted`.
    pub async fn complete_task(
        &self,
        id: TaskId,
        generation: Generation,
        outcome: CompletionOutcome,
    ) -> Result<Task, QueueError> {
        request!(self, Complete { id: id, generation: generation, outcome: outcome })?
    }

    /// Fenced failure; retries or dead-letters and publishes the matching
    /// event
    ///
    /// # Errors
    /// `NotFound`, `InvalidState`, `StaleGeneration`, `TableCorrupted`.
    pub async fn fail_task(
        &self,
        id: TaskId,
        generation: Generation,
        error: String,
    ) -> Result<(FailureOutcome, Task), QueueError> {
        request!(self, Fail { id: id, generation: generation, error: error })?
    }

    /// Fire-and-forget progress touch; protects against the stuck sweep
    pub fn update_progress(&self, id: TaskId) {
        if self.tx.try_send(Command::Progress { id }).is_err() {
            warn!(%id, "progress update dropped, queue mailbox full or closed");
        }
    }

    /// Reconnect reconciliation for a task id an agent reports in-flight
    ///
    /// # Errors
    /// `NotFound` when the id is unknown.
    pub async fn recover_task(&self, id: TaskId) -> Result<RecoverOutcome, QueueError> {
        request!(self, Recover { id: id })?
    }

    /// Forces an assigned task back to queued with a fresh generation
    ///
    /// # Errors
    /// `NotFound`, `NotAssigned`, `TableCorrupted`.
    pub async fn reclaim_task(&self, id: TaskId, reason: &str) -> Result<Task, QueueError> {
        request!(self, Reclaim { id: id, reason: reason.to_string() })?
    }

    /// Moves a dead-letter record back to queued with a reset retry budget
    ///
    /// # Errors
    /// `NotFound`, `TableCorrupted`.
    pub async fn retry_dead_letter(&self, id: TaskId) -> Result<Task, QueueError> {
        request!(self, RetryDeadLetter { id: id })?
    }

    /// Admin purge of one dead-letter record
    ///
    /// # Errors
    /// `NotFound`, `TableCorrupted`.
    pub async fn purge_dead_letter(&self, id: TaskId) -> Result<(), QueueError> {
        request!(self, PurgeDeadLetter { id: id })?
    }

    /// TTL sweep helper: `queued -> expired` if still queued, else `None`
    ///
    /// # Errors
    /// `NotFound`, `TableCorrupted`.
    pub async fn expire_task(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        request!(self, Expire { id: id })?
    }

    /// Pre-assignment routing annotation from the scheduler
    ///
    /// # Errors
    /// `NotFound`, `TableCorrupted`.
    pub async fn store_routing_decision(
        &self,
        id: TaskId,
        decision: RoutingDecision,
    ) -> Result<(), QueueError> {
        request!(self, StoreRouting { id: id, decision: decision })?
    }

    /// Counts grouped by status and priority
    ///
    /// # Errors
    /// `Closed` if the actor is gone.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        request!(self, Stats {})
    }
}

/// The task queue component
pub struct TaskQueue;

impl TaskQueue {
    /// Loads durable state, rebuilds the priority index, and spawns the
    /// queue actor. The overdue sweep runs on the configured interval.
    ///
    /// # Errors
    /// `StorageError` when the startup fold fails.
    pub async fn spawn(
        db: &Database,
        bus: EventBus,
        config: &HubConfig,
    ) -> Result<TaskQueueHandle, StorageError> {
        let active = db.table(table::TASK_QUEUE);
        let dead = db.table(table::TASK_DEAD_LETTER);

        let mut tasks: HashMap<TaskId, Task> = HashMap::new();
        active
            .for_each::<Task, _>(|_, task| {
                tasks.insert(task.id, task);
            })
            .await?;

        let mut dead_tasks: HashMap<TaskId, Task> = HashMap::new();
        dead.for_each::<Task, _>(|_, task| {
            dead_tasks.insert(task.id, task);
        })
        .await?;

        let index: BTreeSet<(u8, u64, TaskId)> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(Task::priority_key)
            .collect();

        info!(
            active = tasks.len(),
            dead_letter = dead_tasks.len(),
            queued = index.len(),
            "task queue loaded"
        );

        let (tx, rx) = mpsc::channel(config.mailbox_capacity.as_usize());
        let actor = QueueActor {
            tasks,
            dead_tasks,
            index,
            active,
            dead,
            bus,
            default_max_retries: crate::config::DEFAULT_MAX_RETRIES,
            sweep_interval_ms: config.stuck_sweep_interval_ms.as_u64(),
            mailbox_high: false,
        };
        tokio::spawn(actor.run(rx));
        Ok(TaskQueueHandle { tx })
    }
}

struct QueueActor {
    tasks: HashMap<TaskId, Task>,
    dead_tasks: HashMap<TaskId, Task>,
    index: BTreeSet<(u8, u64, TaskId)>,
    active: KvTable,
    dead: KvTable,
    bus: EventBus,
    default_max_retries: u32,
    sweep_interval_ms: u64,
    mailbox_high: bool,
}

impl QueueActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut sweep =
            tokio::time::interval(std::time::Duration::from_millis(self.sweep_interval_ms));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        sweep.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.watch_mailbox(&rx);
                    self.handle(command).await;
                }
                _ = sweep.tick() => {
                    self.sweep_overdue().await;
                }
            }
        }
        debug!("task queue actor stopped");
    }

    fn watch_mailbox(&mut self, rx: &mpsc::Receiver<Command>) {
        let depth = rx.len();
        if depth > MAILBOX_HIGH_WATERMARK && !self.mailbox_high {
            self.mailbox_high = true;
            self.bus.publish(
                topic::BUS,
                event::ACTOR_MAILBOX_HIGH,
                json!({ "actor": "task_queue", "depth": depth }),
            );
        } else if depth < MAILBOX_HIGH_WATERMARK / 2 {
            self.mailbox_high = false;
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { params, reply } => {
                let _ = reply.send(self.submit(params).await);
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.get(id));
            }
            Command::List { filter, reply } => {
                let _ = reply.send(self.list(&filter));
            }
            Command::DequeueNext { reply } => {
                let _ = reply.send(self.dequeue_next());
            }
            Command::Assign {
                id,
                agent,
                complete_by,
                reply,
            } => {
                let _ = reply.send(self.assign(id, agent, complete_by).await);
            }
            Command::Complete {
                id,
                generation,
                outcome,
                reply,
            } => {
                let _ = reply.send(self.complete(id, generation, outcome).await);
            }
            Command::Fail {
                id,
                generation,
                error,
                reply,
            } => {
                let _ = reply.send(self.fail(id, generation, &error).await);
            }
            Command::Progress { id } => {
                self.progress(id).await;
            }
            Command::Recover { id, reply } => {
                let _ = reply.send(self.recover(id));
            }
            Command::Reclaim { id, reason, reply } => {
                let _ = reply.send(self.reclaim(id, &reason).await);
            }
            Command::RetryDeadLetter { id, reply } => {
                let _ = reply.send(self.retry_dead_letter(id).await);
            }
            Command::PurgeDeadLetter { id, reply } => {
                let _ = reply.send(self.purge_dead_letter(id).await);
            }
            Command::Expire { id, reply } => {
                let _ = reply.send(self.expire(id).await);
            }
            Command::StoreRouting {
                id,
                decision,
                reply,
            } => {
                let _ = reply.send(self.store_routing(id, decision).await);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Persists to the active table, reporting corruption on the bus
    async fn persist(&self, task: &Task) -> Result<(), QueueError> {
        self.persist_to(&self.active, task).await
    }

    async fn persist_to(&self, kv: &KvTable, task: &Task) -> Result<(), QueueError> {
        kv.insert(&task.id.to_string(), task).await.map_err(|e| {
            error!(table = kv.name(), task_id = %task.id, %e, "durable write failed");
            self.bus.publish(
                topic::BUS,
                event::TABLE_CORRUPTED,
                json!({ "table": kv.name(), "message": e.to_string() }),
            );
            QueueError::TableCorrupted {
                table: kv.name().to_string(),
            }
        })
    }

    async fn remove_from(&self, kv: &KvTable, id: TaskId) -> Result<(), QueueError> {
        kv.delete(&id.to_string()).await.map_err(|e| {
            error!(table = kv.name(), task_id = %id, %e, "durable delete failed");
            self.bus.publish(
                topic::BUS,
                event::TABLE_CORRUPTED,
                json!({ "table": kv.name(), "message": e.to_string() }),
            );
            QueueError::TableCorrupted {
                table: kv.name().to_string(),
            }
        })?;
        Ok(())
    }

    fn map_transition(id: TaskId, err: TransitionError, needs: TaskStatus) -> QueueError {
        match err {
            TransitionError::InvalidState { status } => QueueError::InvalidState {
                id,
                status,
                needs,
            },
            TransitionError::StaleGeneration { current, supplied } => QueueError::StaleGeneration {
                id,
                current,
                supplied,
            },
        }
    }

    async fn submit(&mut self, params: SubmitParams) -> Result<Task, QueueError> {
        if params.description.trim().is_empty() {
            return Err(QueueError::InvalidParams {
                reason: "description is required".to_string(),
            });
        }
        if params.description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(QueueError::InvalidParams {
                reason: format!("description exceeds {MAX_DESCRIPTION_CHARS} characters"),
            });
        }

        let task = Task::from_submit(TaskId::generate(), params, self.default_max_retries);
        self.persist(&task).await?;
        self.index.insert(task.priority_key());
        self.tasks.insert(task.id, task.clone());
        self.bus.publish(
            topic::TASKS,
            event::TASK_SUBMITTED,
            json!({ "task_id": task.id, "priority": task.priority }),
        );
        debug!(task_id = %task.id, priority = %task.priority, "task submitted");
        Ok(task)
    }

    fn get(&self, id: TaskId) -> Result<Task, QueueError> {
        self.tasks
            .get(&id)
            .or_else(|| self.dead_tasks.get(&id))
            .cloned()
            .ok_or(QueueError::NotFound { id })
    }

    fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut matched: Vec<Task> = self
            .tasks
            .values()
            .chain(self.dead_tasks.values())
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        matched.sort_by_key(Task::priority_key);
        matched
    }

    fn dequeue_next(&self) -> Option<Task> {
        self.index
            .first()
            .and_then(|(_, _, id)| self.tasks.get(id))
            .cloned()
    }

    async fn assign(
        &mut self,
        id: TaskId,
        agent: AgentId,
        complete_by: Option<EpochMillis>,
    ) -> Result<Task, QueueError> {
        let current = self.tasks.get(&id).ok_or(QueueError::NotFound { id })?;
        let mut task = current.clone();
        let old_key = task.priority_key();
        task.begin_assignment(agent.clone(), complete_by)
            .map_err(|e| Self::map_transition(id, e, TaskStatus::Queued))?;

        self.persist(&task).await?;
        self.index.remove(&old_key);
        self.tasks.insert(id, task.clone());
        self.bus.publish(
            topic::TASKS,
            event::TASK_ASSIGNED,
            json!({
                "task_id": id,
                "agent_id": agent,
                "generation": task.generation,
                "task": task,
            }),
        );
        info!(task_id = %id, agent_id = %agent, generation = %task.generation, "task assigned");
        Ok(task)
    }

    async fn complete(
        &mut self,
        id: TaskId,
        generation: Generation,
        outcome: CompletionOutcome,
    ) -> Result<Task, QueueError> {
        let current = self.tasks.get(&id).ok_or(QueueError::NotFound { id })?;
        let agent = current.assigned_to.clone();
        let mut task = current.clone();
        task.complete(generation, outcome)
            .map_err(|e| Self::map_transition(id, e, TaskStatus::Assigned))?;

        self.persist(&task).await?;
        self.tasks.insert(id, task.clone());
        self.bus.publish(
            topic::TASKS,
            event::TASK_COMPLETED,
            json!({ "task_id": id, "agent_id": agent, "generation": generation }),
        );
        info!(task_id = %id, generation = %generation, "task completed");
        Ok(task)
    }

    async fn fail(
        &mut self,
        id: TaskId,
        generation: Generation,
        error: &str,
    ) -> Result<(FailureOutcome, Task), QueueError> {
        let current = self.tasks.get(&id).ok_or(QueueError::NotFound { id })?;
        let mut task = current.clone();
        let outcome = task
            .record_failure(generation, error)
            .map_err(|e| Self::map_transition(id, e, TaskStatus::Assigned))?;

        match outcome {
            FailureOutcome::Retried => {
                self.persist(&task).await?;
                self.index.insert(task.priority_key());
                self.tasks.insert(id, task.clone());
                self.bus.publish(
                    topic::TASKS,
                    event::TASK_RETRIED,
                    json!({
                        "task_id": id,
                        "retry_count": task.retry_count,
                        "generation": task.generation,
                    }),
                );
                warn!(task_id = %id, retry_count = task.retry_count, error, "task retried");
            }
            FailureOutcome::DeadLetter => {
                self.persist_to(&self.dead, &task).await?;
                self.remove_from(&self.active, id).await?;
                self.tasks.remove(&id);
                self.dead_tasks.insert(id, task.clone());
                self.bus.publish(
                    topic::TASKS,
                    event::TASK_DEAD_LETTER,
                    json!({ "task_id": id, "error": error }),
                );
                warn!(task_id = %id, error, "task dead-lettered");
            }
        }
        Ok((outcome, task))
    }

    async fn progress(&mut self, id: TaskId) {
        let Some(current) = self.tasks.get(&id) else {
            return;
        };
        if current.status != TaskStatus::Assigned {
            return;
        }
        let mut task = current.clone();
        task.touch();
        if self.persist(&task).await.is_ok() {
            self.tasks.insert(id, task);
        }
    }

    fn recover(&self, id: TaskId) -> Result<RecoverOutcome, QueueError> {
        match self.tasks.get(&id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                Ok(RecoverOutcome::Continue(Box::new(task.clone())))
            }
            Some(_) => Ok(RecoverOutcome::Reassign),
            None if self.dead_tasks.contains_key(&id) => Ok(RecoverOutcome::Reassign),
            None => Err(QueueError::NotFound { id }),
        }
    }

    async fn reclaim(&mut self, id: TaskId, reason: &str) -> Result<Task, QueueError> {
        let current = self.tasks.get(&id).ok_or(QueueError::NotFound { id })?;
        if current.status != TaskStatus::Assigned {
            return Err(QueueError::NotAssigned { id });
        }
        let mut task = current.clone();
        task.reclaim(reason)
            .map_err(|e| Self::map_transition(id, e, TaskStatus::Assigned))?;

        self.persist(&task).await?;
        self.index.insert(task.priority_key());
        self.tasks.insert(id, task.clone());
        self.bus.publish(
            topic::TASKS,
            event::TASK_RECLAIMED,
            json!({ "task_id": id, "reason": reason, "generation": task.generation }),
        );
        warn!(task_id = %id, reason, generation = %task.generation, "task reclaimed");
        Ok(task)
    }

    async fn retry_dead_letter(&mut self, id: TaskId) -> Result<Task, QueueError> {
        let current = self
            .dead_tasks
            .get(&id)
            .ok_or(QueueError::NotFound { id })?;
        let mut task = current.clone();
        task.retry_from_dead_letter()
            .map_err(|e| Self::map_transition(id, e, TaskStatus::DeadLetter))?;

        self.persist(&task).await?;
        self.remove_from(&self.dead, id).await?;
        self.dead_tasks.remove(&id);
        self.index.insert(task.priority_key());
        self.tasks.insert(id, task.clone());
        self.bus.publish(
            topic::TASKS,
            event::TASK_RETRIED,
            json!({ "task_id": id, "retry_count": 0, "generation": task.generation }),
        );
        info!(task_id = %id, "dead-letter task requeued");
        Ok(task)
    }

    async fn purge_dead_letter(&mut self, id: TaskId) -> Result<(), QueueError> {
        if !self.dead_tasks.contains_key(&id) {
            return Err(QueueError::NotFound { id });
        }
        self.remove_from(&self.dead, id).await?;
        self.dead_tasks.remove(&id);
        info!(task_id = %id, "dead-letter task purged");
        Ok(())
    }

    async fn expire(&mut self, id: TaskId) -> Result<Option<Task>, QueueError> {
        let current = self.tasks.get(&id).ok_or(QueueError::NotFound { id })?;
        if current.status != TaskStatus::Queued {
            return Ok(None);
        }
        let mut task = current.clone();
        let old_key = task.priority_key();
        task.expire()
            .map_err(|e| Self::map_transition(id, e, TaskStatus::Queued))?;

        self.persist(&task).await?;
        self.index.remove(&old_key);
        self.tasks.insert(id, task.clone());
        self.bus.publish(
            topic::TASKS,
            event::TASK_EXPIRED,
            json!({ "task_id": id }),
        );
        warn!(task_id = %id, "task expired");
        Ok(Some(task))
    }

    async fn store_routing(
        &mut self,
        id: TaskId,
        decision: RoutingDecision,
    ) -> Result<(), QueueError> {
        let current = self.tasks.get(&id).ok_or(QueueError::NotFound { id })?;
        let mut task = current.clone();
        task.routing_decision = Some(decision);
        self.persist(&task).await?;
        self.tasks.insert(id, task);
        Ok(())
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in self.tasks.values().chain(self.dead_tasks.values()) {
            let status = serde_json::to_value(task.status)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| format!("{:?}", task.status));
            *stats.by_status.entry(status).or_default() += 1;
            *stats.by_priority.entry(task.priority.to_string()).or_default() += 1;
        }
        stats.dead_letter = self.dead_tasks.len() as u64;
        stats
    }

    /// Reclaims assigned tasks whose `complete_by` deadline has elapsed
    async fn sweep_overdue(&mut self) {
        let now = EpochMillis::now();
        let overdue: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Assigned
                    && t.complete_by.is_some_and(|deadline| deadline < now)
            })
            .map(|t| t.id)
            .collect();

        for id in overdue {
            if let Err(e) = self.reclaim(id, "overdue").await {
                warn!(task_id = %id, %e, "overdue reclaim failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusCapacity;
    use crate::events::Subscription;

    async fn queue_fixture() -> (TaskQueueHandle, EventBus, Subscription) {
        let db = Database::open_in_memory().await.unwrap();
        let bus = EventBus::new(BusCapacity::try_new(256).unwrap());
        let sub = bus.subscribe(topic::TASKS);
        let handle = TaskQueue::spawn(&db, bus.clone(), &HubConfig::default())
            .await
            .unwrap();
        (handle, bus, sub)
    }

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    #[tokio::test]
    async fn submit_then_get_round_trips() {
        let (queue, _bus, mut sub) = queue_fixture().await;

        let task = queue
            .submit(SubmitParams::with_description("do the thing"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.generation, Generation::zero());

        let fetched = queue.get(task.id).await.unwrap();
        assert_eq!(fetched.description, "do the thing");

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.event, event::TASK_SUBMITTED);
    }

    #[tokio::test]
    async fn submit_requires_bounded_description() {
        let (queue, _bus, _sub) = queue_fixture().await;
        let err = queue
            .submit(SubmitParams::with_description("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidParams { .. }));

        let err = queue
            .submit(SubmitParams::with_description("x".repeat(10_001)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn assign_complete_with_valid_generation() {
        let (queue, _bus, _sub) = queue_fixture().await;
        let task = queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();

        let assigned = queue.assign_task(task.id, agent("a"), None).await.unwrap();
        assert_eq!(assigned.generation.as_u64(), 1);

        let completed = queue
            .complete_task(task.id, assigned.generation, CompletionOutcome::default())
            .await
            .unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);

        // An older generation is a fenced no-op.
        let err = queue
            .complete_task(task.id, Generation::zero(), CompletionOutcome::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn stale_generation_rejected_after_reclaim() {
        let (queue, _bus, _sub) = queue_fixture().await;
        let task = queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();

        let first = queue.assign_task(task.id, agent("a"), None).await.unwrap();
        queue.reclaim_task(task.id, "disconnect").await.unwrap();
        let second = queue.assign_task(task.id, agent("b"), None).await.unwrap();
        assert!(second.generation > first.generation);

        let err = queue
            .complete_task(task.id, first.generation, CompletionOutcome::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::StaleGeneration { .. }));

        let current = queue.get(task.id).await.unwrap();
        assert_eq!(current.status, TaskStatus::Assigned);
        assert_eq!(current.assigned_to, Some(agent("b")));
    }

    #[tokio::test]
    async fn retries_then_dead_letter_then_requeue() {
        let (queue, _bus, _sub) = queue_fixture().await;
        let mut params = SubmitParams::with_description("flaky");
        params.max_retries = Some(2);
        let task = queue.submit(params).await.unwrap();

        for round in 0..2 {
            let assigned = queue.assign_task(task.id, agent("a"), None).await.unwrap();
            let (outcome, after) = queue
                .fail_task(task.id, assigned.generation, format!("err {round}"))
                .await
                .unwrap();
            assert_eq!(outcome, FailureOutcome::Retried);
            assert_eq!(after.status, TaskStatus::Queued);
        }

        let assigned = queue.assign_task(task.id, agent("a"), None).await.unwrap();
        let (outcome, _) = queue
            .fail_task(task.id, assigned.generation, "fatal".to_string())
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLetter);
        assert_eq!(queue.stats().await.unwrap().dead_letter, 1);

        // Dead-letter records stay visible and can be requeued.
        let fetched = queue.get(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::DeadLetter);
        let requeued = queue.retry_dead_letter(task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(queue.stats().await.unwrap().dead_letter, 0);
    }

    #[tokio::test]
    async fn dequeue_next_respects_priority_then_fifo() {
        let (queue, _bus, _sub) = queue_fixture().await;

        let mut low = SubmitParams::with_description("low");
        low.priority = TaskPriority::Low;
        queue.submit(low).await.unwrap();

        let mut urgent = SubmitParams::with_description("urgent");
        urgent.priority = TaskPriority::Urgent;
        let urgent_task = queue.submit(urgent).await.unwrap();

        let head = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(head.id, urgent_task.id);

        // Peeking does not mutate.
        let again = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(again.id, urgent_task.id);
    }

    #[tokio::test]
    async fn recover_distinguishes_live_from_stale() {
        let (queue, _bus, _sub) = queue_fixture().await;
        let task = queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();
        queue.assign_task(task.id, agent("a"), None).await.unwrap();

        match queue.recover_task(task.id).await.unwrap() {
            RecoverOutcome::Continue(live) => assert_eq!(live.id, task.id),
            RecoverOutcome::Reassign => panic!("expected continue"),
        }

        queue.reclaim_task(task.id, "disconnect").await.unwrap();
        assert!(matches!(
            queue.recover_task(task.id).await.unwrap(),
            RecoverOutcome::Reassign
        ));

        assert!(matches!(
            queue.recover_task(TaskId::generate()).await.unwrap_err(),
            QueueError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn reclaim_requires_assignment() {
        let (queue, _bus, _sub) = queue_fixture().await;
        let task = queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();
        let err = queue.reclaim_task(task.id, "nope").await.unwrap_err();
        assert!(matches!(err, QueueError::NotAssigned { .. }));
    }

    #[tokio::test]
    async fn index_rebuilds_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let bus = EventBus::new(BusCapacity::try_new(64).unwrap());

        let first_id;
        {
            let db = Database::open(&path).await.unwrap();
            let queue = TaskQueue::spawn(&db, bus.clone(), &HubConfig::default())
                .await
                .unwrap();
            let mut urgent = SubmitParams::with_description("survives");
            urgent.priority = TaskPriority::Urgent;
            first_id = queue.submit(urgent).await.unwrap().id;
            queue
                .submit(SubmitParams::with_description("also survives"))
                .await
                .unwrap();
        }

        let db = Database::open(&path).await.unwrap();
        let queue = TaskQueue::spawn(&db, bus, &HubConfig::default())
            .await
            .unwrap();
        let head = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(head.id, first_id);
        let queued = queue.list(TaskFilter::status(TaskStatus::Queued)).await.unwrap();
        assert_eq!(queued.len(), 2);
    }
}
