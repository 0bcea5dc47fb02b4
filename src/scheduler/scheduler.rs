//! Event-reactive scheduler
//!
//! Listens for events that can create a schedulable opportunity, snapshots
//! idle agents and queued tasks, and greedily matches under capability,
//! dependency, repo, routing, and rate-limit filters. Also owns the stuck
//! and TTL sweeps and the routing fallback timers.
//!
//! The scheduler only ever *calls* the queue and FSM; it never receives
//! calls from them. That keeps the event-bus back edge acyclic.

use crate::config::HubConfig;
use crate::domain_types::{AgentId, EpochMillis, RouteTarget, RouteTier, TaskId};
use crate::events::{EventBus, Subscription, event, topic};
use crate::queue::{QueueError, Task, TaskFilter, TaskQueueHandle, TaskStatus};
use crate::agents::{AgentFsmHandle, AgentRecord};
use crate::scheduler::routing::{RoutingOutcome, SchedulerDeps};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Msg {
    /// Manual scheduling kick, used by the hub at startup
    Kick,
    /// A routing fallback timer elapsed
    FallbackFired { task_id: TaskId },
    Shutdown,
}

/// Cloneable handle on the scheduler actor
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Msg>,
}

impl SchedulerHandle {
    /// Requests an immediate scheduling pass
    pub fn kick(&self) {
        let _ = self.tx.try_send(Msg::Kick);
    }

    /// Stops the scheduler loop
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown).await;
    }
}

/// The scheduler component
pub struct Scheduler;

impl Scheduler {
    /// Subscribes to the bus and spawns the scheduler actor
    #[must_use]
    pub fn spawn(
        bus: EventBus,
        queue: TaskQueueHandle,
        fsm: AgentFsmHandle,
        deps: SchedulerDeps,
        config: &HubConfig,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.as_usize());
        let actor = SchedulerActor {
            tasks_sub: bus.subscribe(topic::TASKS),
            presence_sub: bus.subscribe(topic::PRESENCE),
            routing_sub: bus.subscribe(topic::ROUTING),
            queue,
            fsm,
            deps,
            fallback_pending: HashMap::new(),
            tier_overrides: HashMap::new(),
            fallback_wait_ms: config.fallback_wait_ms.as_u64(),
            stuck_sweep_interval_ms: config.stuck_sweep_interval_ms.as_u64(),
            stuck_threshold_ms: config.stuck_threshold_ms.as_u64(),
            ttl_sweep_interval_ms: config.ttl_sweep_interval_ms.as_u64(),
            task_ttl_ms: config.task_ttl_ms.as_u64(),
            own_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        SchedulerHandle { tx }
    }
}

/// Events that create a scheduling opportunity. `task_assigned` is
/// deliberately absent (it would loop) as is `task_dead_letter` (no
/// opportunity).
fn is_trigger(name: &str) -> bool {
    matches!(
        name,
        event::TASK_SUBMITTED
            | event::TASK_RETRIED
            | event::TASK_RECLAIMED
            | event::TASK_COMPLETED
            | event::AGENT_JOINED
            | event::AGENT_IDLE
            | event::ENDPOINT_CHANGED
    )
}

/// Events that settle a task and therefore cancel its fallback timer
fn cancels_fallback(name: &str) -> bool {
    matches!(
        name,
        event::TASK_ASSIGNED
            | event::TASK_COMPLETED
            | event::TASK_RECLAIMED
            | event::TASK_DEAD_LETTER
            | event::TASK_EXPIRED
    )
}

fn payload_task_id(payload: &Value) -> Option<TaskId> {
    payload
        .get("task_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(TaskId::from)
}

struct SchedulerActor {
    tasks_sub: Subscription,
    presence_sub: Subscription,
    routing_sub: Subscription,
    queue: TaskQueueHandle,
    fsm: AgentFsmHandle,
    deps: SchedulerDeps,
    /// Tasks with a live fallback timer, mapped to the tier the timer will
    /// escalate to
    fallback_pending: HashMap<TaskId, RouteTier>,
    /// One-shot preferred tiers consumed by the next pass
    tier_overrides: HashMap<TaskId, RouteTier>,
    fallback_wait_ms: u64,
    stuck_sweep_interval_ms: u64,
    stuck_threshold_ms: u64,
    ttl_sweep_interval_ms: u64,
    task_ttl_ms: u64,
    own_tx: mpsc::Sender<Msg>,
}

impl SchedulerActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        let mut stuck =
            tokio::time::interval(Duration::from_millis(self.stuck_sweep_interval_ms));
        let mut ttl = tokio::time::interval(Duration::from_millis(self.ttl_sweep_interval_ms));
        stuck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ttl.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        stuck.tick().await;
        ttl.tick().await;

        info!("scheduler started");
        loop {
            let mut schedule = false;
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        None | Some(Msg::Shutdown) => break,
                        Some(Msg::Kick) => schedule = true,
                        Some(Msg::FallbackFired { task_id }) => {
                            schedule = self.fallback_fired(task_id);
                        }
                    }
                }
                ev = self.tasks_sub.recv() => {
                    let Some(ev) = ev else { break };
                    schedule = self.note_event(&ev.event, &ev.payload);
                }
                ev = self.presence_sub.recv() => {
                    let Some(ev) = ev else { break };
                    schedule = self.note_event(&ev.event, &ev.payload);
                }
                ev = self.routing_sub.recv() => {
                    let Some(ev) = ev else { break };
                    schedule = self.note_event(&ev.event, &ev.payload);
                }
                _ = stuck.tick() => {
                    self.sweep_stuck().await;
                }
                _ = ttl.tick() => {
                    self.sweep_ttl().await;
                }
            }

            // Coalesce: drain everything pending before one pass so a burst
            // of triggers costs a single re-run.
            schedule |= self.drain_pending();
            if schedule {
                self.run_pass().await;
            }
        }
        info!("scheduler stopped");
    }

    /// Bookkeeps one event; returns whether it is a scheduling trigger
    fn note_event(&mut self, name: &str, payload: &Value) -> bool {
        if cancels_fallback(name)
            && let Some(task_id) = payload_task_id(payload)
            && self.fallback_pending.remove(&task_id).is_some()
        {
            debug!(%task_id, "fallback timer cancelled by {name}");
        }
        is_trigger(name)
    }

    fn drain_pending(&mut self) -> bool {
        let mut any = false;
        while let Some(ev) = self.tasks_sub.try_recv() {
            any |= self.note_event(&ev.event, &ev.payload);
        }
        while let Some(ev) = self.presence_sub.try_recv() {
            any |= self.note_event(&ev.event, &ev.payload);
        }
        while let Some(ev) = self.routing_sub.try_recv() {
            any |= self.note_event(&ev.event, &ev.payload);
        }
        any
    }

    fn fallback_fired(&mut self, task_id: TaskId) -> bool {
        match self.fallback_pending.remove(&task_id) {
            Some(next_tier) => {
                debug!(%task_id, tier = %next_tier, "fallback timer fired, escalating");
                self.tier_overrides.insert(task_id, next_tier);
                true
            }
            // Cancelled while the timer was in flight.
            None => false,
        }
    }

    fn arm_fallback(&mut self, task_id: TaskId, current_tier: RouteTier) {
        let Some(next_tier) = current_tier.escalate() else {
            return;
        };
        // Multiple fallback signals for one task collapse to one timer.
        if self.fallback_pending.contains_key(&task_id) {
            return;
        }
        self.fallback_pending.insert(task_id, next_tier);

        let tx = self.own_tx.clone();
        let wait = Duration::from_millis(self.fallback_wait_ms);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = tx.send(Msg::FallbackFired { task_id }).await;
        });
    }

    /// One greedy matching pass: tasks in priority order, first eligible
    /// idle agent each, no backtracking.
    async fn run_pass(&mut self) {
        let Ok(agents) = self.fsm.list_all().await else {
            return;
        };
        let mut idle: Vec<AgentRecord> = Vec::new();
        for agent in agents {
            if agent.is_idle() && !self.deps.rate_limiter.rate_limited(&agent.agent_id).await {
                idle.push(agent);
            }
        }
        if idle.is_empty() {
            self.tier_overrides.clear();
            return;
        }

        let Ok(queued) = self.queue.list(TaskFilter::status(TaskStatus::Queued)).await else {
            return;
        };

        for task in queued {
            if idle.is_empty() {
                break;
            }
            if !self.repo_eligible(&task).await || !self.deps_met(&task).await {
                continue;
            }

            let preferred = self.tier_overrides.remove(&task.id);
            let decision = match self.deps.resolver.resolve(&task, preferred).await {
                RoutingOutcome::Decision(decision) => decision,
                RoutingOutcome::Fallback { tier, reason } => {
                    debug!(task_id = %task.id, %tier, reason, "routing fallback");
                    self.arm_fallback(task.id, tier);
                    // Graceful degradation: still try capability matching.
                    crate::domain_types::RoutingDecision::degraded(tier, &reason)
                }
            };

            let Some(slot) = Self::pick_agent(&idle, &task, &decision) else {
                continue;
            };
            let agent_id = idle[slot].agent_id.clone();

            if self.try_assign(&task, agent_id, &decision).await {
                idle.swap_remove(slot);
                self.fallback_pending.remove(&task.id);
            }
        }
        self.tier_overrides.clear();
    }

    async fn repo_eligible(&self, task: &Task) -> bool {
        match &task.repo {
            Some(repo) => self.deps.repo_registry.is_active(repo).await,
            None => true,
        }
    }

    async fn deps_met(&self, task: &Task) -> bool {
        for dep in &task.depends_on {
            match self.queue.get(*dep).await {
                Ok(dep_task) if dep_task.status == TaskStatus::Completed => {}
                _ => return false,
            }
        }
        true
    }

    /// Index into `idle` of the agent this task should go to
    fn pick_agent(
        idle: &[AgentRecord],
        task: &Task,
        decision: &crate::domain_types::RoutingDecision,
    ) -> Option<usize> {
        // Explicit override restricts to exactly that agent.
        if let Some(wanted) = &task.assign_to {
            return idle.iter().position(|a| &a.agent_id == wanted);
        }

        let capable =
            |a: &AgentRecord| a.covers(&task.needed_capabilities);

        // Local-model targets prefer endpoint-host affinity.
        if decision.target_type == RouteTarget::LocalModel
            && let Some(endpoint) = &decision.selected_endpoint
        {
            let affine = idle
                .iter()
                .position(|a| capable(a) && a.endpoint_host.as_deref() == Some(endpoint.as_str()));
            if affine.is_some() {
                return affine;
            }
        }

        idle.iter().position(capable)
    }

    async fn try_assign(
        &self,
        task: &Task,
        agent_id: AgentId,
        decision: &crate::domain_types::RoutingDecision,
    ) -> bool {
        if let Err(e) = self
            .queue
            .store_routing_decision(task.id, decision.clone())
            .await
        {
            debug!(task_id = %task.id, %e, "routing annotation skipped");
        }

        // Reserve the agent before the queue publishes: the push relay
        // fires on `task_assigned`, and the agent's `task_accepted` must
        // find the state machine already in `assigned`.
        if let Err(e) = self.fsm.assign(agent_id.clone(), task.id).await {
            debug!(task_id = %task.id, %agent_id, %e, "agent raced away");
            return false;
        }

        match self
            .queue
            .assign_task(task.id, agent_id.clone(), None)
            .await
        {
            Ok(_) => true,
            err => {
                // Assignment race: the task settled under us. Release the
                // reservation; the reject path absorbs the no-op reclaim.
                if let Err(QueueError::InvalidState { .. } | QueueError::NotFound { .. }) = err {
                    debug!(task_id = %task.id, "task settled before assignment");
                } else if let Err(e) = err {
                    warn!(task_id = %task.id, %e, "assignment failed");
                }
                if let Err(e) = self
                    .fsm
                    .reject(agent_id.clone(), task.id, "assignment race")
                    .await
                {
                    warn!(task_id = %task.id, %agent_id, %e, "reservation release failed");
                }
                false
            }
        }
    }

    /// Reclaims assigned tasks with no progress inside the threshold
    async fn sweep_stuck(&self) {
        let Ok(assigned) = self
            .queue
            .list(TaskFilter::status(TaskStatus::Assigned))
            .await
        else {
            return;
        };
        let now = EpochMillis::now();
        for task in assigned {
            if task.updated_at.elapsed_until(now) > self.stuck_threshold_ms {
                warn!(task_id = %task.id, "stuck assignment, reclaiming");
                if let Err(e) = self.queue.reclaim_task(task.id, "stuck").await {
                    debug!(task_id = %task.id, %e, "stuck reclaim skipped");
                }
            }
        }
    }

    /// Expires queued tasks older than the TTL, excluding trivial-tier work
    async fn sweep_ttl(&self) {
        let Ok(queued) = self.queue.list(TaskFilter::status(TaskStatus::Queued)).await else {
            return;
        };
        let now = EpochMillis::now();
        for task in queued {
            let trivial = task
                .routing_decision
                .as_ref()
                .is_some_and(|d| d.effective_tier == RouteTier::Trivial);
            if !trivial && task.created_at.elapsed_until(now) > self.task_ttl_ms {
                if let Err(e) = self.queue.expire_task(task.id).await {
                    debug!(task_id = %task.id, %e, "expire skipped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::routing::{RateLimiter, RepoRegistry, RoutingResolver};
    use crate::agents::AgentFsm;
    use crate::config::BusCapacity;
    use crate::domain_types::CapabilityName;
    use crate::queue::{SubmitParams, TaskQueue};
    use crate::storage::Database;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        bus: EventBus,
        queue: TaskQueueHandle,
        fsm: AgentFsmHandle,
        _scheduler: SchedulerHandle,
    }

    async fn fixture_with(deps: SchedulerDeps, config: HubConfig) -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let bus = EventBus::new(BusCapacity::try_new(512).unwrap());
        let queue = TaskQueue::spawn(&db, bus.clone(), &config).await.unwrap();
        let fsm = AgentFsm::spawn(bus.clone(), queue.clone(), &config);
        let scheduler = Scheduler::spawn(bus.clone(), queue.clone(), fsm.clone(), deps, &config);
        Fixture {
            bus,
            queue,
            fsm,
            _scheduler: scheduler,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(SchedulerDeps::default(), HubConfig::default()).await
    }

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    fn cap(name: &str) -> CapabilityName {
        CapabilityName::try_new(name.to_string()).unwrap()
    }

    async fn wait_for_assignment(queue: &TaskQueueHandle, id: TaskId) -> Task {
        for _ in 0..100 {
            let task = queue.get(id).await.unwrap();
            if task.status == TaskStatus::Assigned {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {id} never assigned");
    }

    #[tokio::test]
    async fn submit_after_connect_assigns_within_one_trigger() {
        let f = fixture().await;
        f.fsm
            .connect(agent("a"), [cap("code")].into_iter().collect(), None)
            .await;

        let task = f
            .queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();
        let assigned = wait_for_assignment(&f.queue, task.id).await;
        assert_eq!(assigned.assigned_to, Some(agent("a")));
        assert_eq!(assigned.generation.as_u64(), 1);
        assert!(assigned.routing_decision.is_some());
    }

    #[tokio::test]
    async fn capability_filter_excludes_unqualified_agents() {
        let f = fixture().await;
        f.fsm
            .connect(agent("plain"), HashSet::new(), None)
            .await;

        let mut params = SubmitParams::with_description("needs gpu");
        params.needed_capabilities = [cap("gpu")].into_iter().collect();
        let task = f.queue.submit(params).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.queue.get(task.id).await.unwrap().status,
            TaskStatus::Queued
        );

        // A qualified agent joining is a trigger.
        f.fsm
            .connect(agent("gpu-box"), [cap("gpu")].into_iter().collect(), None)
            .await;
        let assigned = wait_for_assignment(&f.queue, task.id).await;
        assert_eq!(assigned.assigned_to, Some(agent("gpu-box")));
    }

    #[tokio::test]
    async fn dependency_gating_defers_until_completion() {
        let f = fixture().await;
        f.fsm.connect(agent("a"), HashSet::new(), None).await;
        f.fsm.connect(agent("b"), HashSet::new(), None).await;

        let first = f
            .queue
            .submit(SubmitParams::with_description("first"))
            .await
            .unwrap();
        let mut second_params = SubmitParams::with_description("second");
        second_params.depends_on = [first.id].into_iter().collect();
        let second = f.queue.submit(second_params).await.unwrap();

        let assigned_first = wait_for_assignment(&f.queue, first.id).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.queue.get(second.id).await.unwrap().status,
            TaskStatus::Queued
        );

        f.queue
            .complete_task(first.id, assigned_first.generation, Default::default())
            .await
            .unwrap();

        let assigned_second = wait_for_assignment(&f.queue, second.id).await;
        assert!(assigned_second.assigned_to.is_some());
        let queued = f
            .queue
            .list(TaskFilter::status(TaskStatus::Queued))
            .await
            .unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn assign_to_override_waits_for_exact_agent() {
        let f = fixture().await;
        f.fsm.connect(agent("other"), HashSet::new(), None).await;

        let mut params = SubmitParams::with_description("pinned");
        params.assign_to = Some(agent("wanted"));
        let task = f.queue.submit(params).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.queue.get(task.id).await.unwrap().status,
            TaskStatus::Queued
        );

        f.fsm.connect(agent("wanted"), HashSet::new(), None).await;
        let assigned = wait_for_assignment(&f.queue, task.id).await;
        assert_eq!(assigned.assigned_to, Some(agent("wanted")));
    }

    #[tokio::test]
    async fn priority_order_governs_matching() {
        let f = fixture().await;

        let mut low = SubmitParams::with_description("low");
        low.priority = crate::domain_types::TaskPriority::Low;
        let low_task = f.queue.submit(low).await.unwrap();

        let mut urgent = SubmitParams::with_description("urgent");
        urgent.priority = crate::domain_types::TaskPriority::Urgent;
        let urgent_task = f.queue.submit(urgent).await.unwrap();

        // One agent: only the urgent task can win it.
        f.fsm.connect(agent("solo"), HashSet::new(), None).await;
        let assigned = wait_for_assignment(&f.queue, urgent_task.id).await;
        assert_eq!(assigned.assigned_to, Some(agent("solo")));
        assert_eq!(
            f.queue.get(low_task.id).await.unwrap().status,
            TaskStatus::Queued
        );
    }

    struct AlwaysFallback {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RoutingResolver for AlwaysFallback {
        async fn resolve(
            &self,
            _task: &Task,
            preferred_tier: Option<RouteTier>,
        ) -> RoutingOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RoutingOutcome::Fallback {
                tier: preferred_tier.unwrap_or(RouteTier::Trivial),
                reason: "no endpoint".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn fallback_still_degrades_to_capability_assignment() {
        let resolver = Arc::new(AlwaysFallback {
            calls: AtomicUsize::new(0),
        });
        let deps = SchedulerDeps {
            resolver: resolver.clone(),
            ..SchedulerDeps::default()
        };
        let f = fixture_with(deps, HubConfig::default()).await;
        f.fsm.connect(agent("a"), HashSet::new(), None).await;

        let task = f
            .queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();
        let assigned = wait_for_assignment(&f.queue, task.id).await;
        let decision = assigned.routing_decision.unwrap();
        assert!(decision.fallback_used);
        assert!(resolver.calls.load(Ordering::SeqCst) >= 1);
    }

    struct DenyList {
        denied: AgentId,
    }

    #[async_trait]
    impl RateLimiter for DenyList {
        async fn rate_limited(&self, agent_id: &AgentId) -> bool {
            agent_id == &self.denied
        }
    }

    #[tokio::test]
    async fn rate_limited_agents_are_skipped() {
        let deps = SchedulerDeps {
            rate_limiter: Arc::new(DenyList {
                denied: agent("limited"),
            }),
            ..SchedulerDeps::default()
        };
        let f = fixture_with(deps, HubConfig::default()).await;
        f.fsm.connect(agent("limited"), HashSet::new(), None).await;

        let task = f
            .queue
            .submit(SubmitParams::with_description("x"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.queue.get(task.id).await.unwrap().status,
            TaskStatus::Queued
        );

        f.fsm.connect(agent("free"), HashSet::new(), None).await;
        let assigned = wait_for_assignment(&f.queue, task.id).await;
        assert_eq!(assigned.assigned_to, Some(agent("free")));
    }

    struct InactiveRepos;

    #[async_trait]
    impl RepoRegistry for InactiveRepos {
        async fn is_active(&self, _repo: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn inactive_repo_blocks_scheduling() {
        let deps = SchedulerDeps {
            repo_registry: Arc::new(InactiveRepos),
            ..SchedulerDeps::default()
        };
        let f = fixture_with(deps, HubConfig::default()).await;
        f.fsm.connect(agent("a"), HashSet::new(), None).await;

        let mut params = SubmitParams::with_description("repo work");
        params.repo = Some("archived/old".to_string());
        let task = f.queue.submit(params).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.queue.get(task.id).await.unwrap().status,
            TaskStatus::Queued
        );
        // The bus itself stays healthy.
        drop(f.bus);
    }
}
