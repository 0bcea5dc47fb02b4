//! Per-connection agent session actor
//!
//! Protocol endpoint for one live bidirectional connection. Decodes and
//! validates inbound frames, drives the queue and the agent state machine,
//! enforces heartbeats and the violation budget, relays outbound pushes,
//! and reconciles in-flight tasks on reconnect.

use crate::agents::AgentFsmHandle;
use crate::config::{HubConfig, MAX_WAKE_ATTEMPTS, PROTOCOL_VERSION};
use crate::domain_types::{AgentId, CapabilityName, EpochMillis, Generation, TaskId};
use crate::events::{EventBus, event, topic};
use crate::queue::{CompletionOutcome, QueueError, RecoverOutcome, TaskQueueHandle};
use crate::session::backoff::ViolationBackoff;
use crate::session::protocol::{InboundFrame, OutboundFrame, parse_inbound};
use crate::session::registry::{SessionCommand, SessionRegistry, SessionSender};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transport-level failure
#[derive(Debug, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    /// Wraps any transport failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One bidirectional text-frame stream
///
/// The session owns the hub side; WebSocket and in-process channel
/// implementations both satisfy this.
#[async_trait]
pub trait FrameTransport: Send {
    /// Sends one encoded frame
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Receives the next frame; `None` when the peer closed
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Closes the stream
    async fn close(&mut self);
}

/// Token validation seam, owned by an external auth collaborator
#[async_trait]
pub trait AuthValidator: Send + Sync {
    async fn validate(&self, agent_id: &str, token: &str) -> bool;
}

/// Default validator: any non-empty token is accepted
#[derive(Debug, Clone, Default)]
pub struct AllowAllAuth;

#[async_trait]
impl AuthValidator for AllowAllAuth {
    async fn validate(&self, _agent_id: &str, token: &str) -> bool {
        !token.is_empty()
    }
}

/// Sink for `resource_report` frames, owned by an external metrics
/// collaborator
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_resources(&self, agent_id: &AgentId, metrics: &HashMap<String, Value>);
}

/// Default sink: logs at debug
#[derive(Debug, Clone, Default)]
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    async fn record_resources(&self, agent_id: &AgentId, metrics: &HashMap<String, Value>) {
        debug!(agent_id = %agent_id, count = metrics.len(), "resource report");
    }
}

/// Dependencies shared by every session
#[derive(Clone)]
pub struct SessionContext {
    pub queue: TaskQueueHandle,
    pub fsm: AgentFsmHandle,
    pub bus: EventBus,
    pub registry: SessionRegistry,
    pub backoff: ViolationBackoff,
    pub auth: Arc<dyn AuthValidator>,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: HubConfig,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    Unauthorized,
    Cooldown,
    TooManyViolations,
    HeartbeatLost,
    Superseded,
    HubClosed,
}

/// Sliding violation window
struct ViolationWindow {
    window_start: EpochMillis,
    count: u32,
    window_ms: u64,
    threshold: u32,
}

impl ViolationWindow {
    fn new(window_ms: u64, threshold: u32) -> Self {
        Self {
            window_start: EpochMillis::now(),
            count: 0,
            window_ms,
            threshold,
        }
    }

    /// Counts one violation; true when the budget is exhausted
    fn note(&mut self) -> bool {
        let now = EpochMillis::now();
        if self.window_start.elapsed_until(now) > self.window_ms {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count >= self.threshold
    }
}

/// One live agent session
pub struct AgentSession<T: FrameTransport> {
    ctx: SessionContext,
    transport: T,
    session_id: Uuid,
    rx: mpsc::Receiver<SessionCommand>,
    sender: SessionSender,
    agent_id: Option<AgentId>,
    task_generations: HashMap<TaskId, Generation>,
    violations: ViolationWindow,
    missed_pongs: u32,
    pong_due: Option<tokio::time::Instant>,
}

impl<T: FrameTransport + 'static> AgentSession<T> {
    /// Spawns the session actor over an open transport
    pub fn spawn(ctx: SessionContext, transport: T) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(64);
        let session_id = Uuid::new_v4();
        let violations = ViolationWindow::new(
            ctx.config.violation_window_ms.as_u64(),
            ctx.config.violation_threshold.as_u32(),
        );
        let session = Self {
            ctx,
            transport,
            session_id,
            rx,
            sender: SessionSender::new(session_id, tx),
            agent_id: None,
            task_generations: HashMap::new(),
            violations,
            missed_pongs: 0,
            pong_due: None,
        };
        tokio::spawn(session.run())
    }

    async fn run(mut self) {
        let reason = match self.identify_phase().await {
            Ok(()) => self.identified_phase().await,
            Err(reason) => reason,
        };
        self.shutdown(reason).await;
    }

    async fn push(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        self.transport.send(frame.encode()).await
    }

    /// Counts a violation; returns the close reason once over budget
    async fn violation(&mut self, detail: &str) -> Option<CloseReason> {
        warn!(session = %self.session_id, detail, "protocol violation");
        if !self.violations.note() {
            return None;
        }
        if let Some(agent_id) = self.agent_id.clone() {
            match self.ctx.backoff.record_offense(agent_id.as_str()).await {
                Ok(cooldown_ms) => {
                    info!(agent_id = %agent_id, cooldown_ms, "violation backoff recorded");
                }
                Err(e) => warn!(agent_id = %agent_id, %e, "backoff ledger write failed"),
            }
        }
        let _ = self
            .push(&OutboundFrame::Error {
                error: "too_many_violations".to_string(),
                retry_after_s: None,
            })
            .await;
        Some(CloseReason::TooManyViolations)
    }

    /// Unidentified phase: exactly one identify frame is accepted
    async fn identify_phase(&mut self) -> Result<(), CloseReason> {
        loop {
            let Some(received) = self.transport.recv().await else {
                return Err(CloseReason::PeerClosed);
            };
            let text = match received {
                Ok(text) => text,
                Err(e) => {
                    debug!(session = %self.session_id, %e, "transport error before identify");
                    return Err(CloseReason::PeerClosed);
                }
            };

            let frame = match parse_inbound(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    if let Some(reason) = self.violation(&e.to_string()).await {
                        return Err(reason);
                    }
                    continue;
                }
            };

            match frame {
                InboundFrame::Identify {
                    agent_id,
                    token,
                    capabilities,
                    client_type,
                    protocol_version,
                    endpoint_host,
                    in_flight,
                } => {
                    return self
                        .handle_identify(
                            agent_id,
                            &token,
                            capabilities,
                            client_type,
                            protocol_version,
                            endpoint_host,
                            in_flight,
                        )
                        .await;
                }
                InboundFrame::Ping => {
                    let _ = self.push(&OutboundFrame::Pong).await;
                }
                other => {
                    let detail = format!("frame before identify: {other:?}");
                    if let Some(reason) = self.violation(&detail).await {
                        return Err(reason);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_identify(
        &mut self,
        agent_id: String,
        token: &str,
        capabilities: Vec<String>,
        client_type: Option<String>,
        protocol_version: Option<u32>,
        endpoint_host: Option<String>,
        in_flight: Vec<TaskId>,
    ) -> Result<(), CloseReason> {
        let Ok(agent_id) = AgentId::try_new(agent_id) else {
            let _ = self
                .push(&OutboundFrame::Error {
                    error: "invalid agent_id".to_string(),
                    retry_after_s: None,
                })
                .await;
            return Err(CloseReason::Unauthorized);
        };

        if !self.ctx.auth.validate(agent_id.as_str(), token).await {
            let _ = self
                .push(&OutboundFrame::Error {
                    error: "unauthorized".to_string(),
                    retry_after_s: None,
                })
                .await;
            return Err(CloseReason::Unauthorized);
        }

        match self.ctx.backoff.remaining_cooldown_s(agent_id.as_str()).await {
            Ok(Some(retry_after_s)) => {
                let _ = self
                    .push(&OutboundFrame::Error {
                        error: "cooldown".to_string(),
                        retry_after_s: Some(retry_after_s),
                    })
                    .await;
                return Err(CloseReason::Cooldown);
            }
            Ok(None) => {}
            Err(e) => warn!(agent_id = %agent_id, %e, "backoff ledger read failed"),
        }

        // At most one live session per agent id: the prior session is told
        // to stand down before this one is admitted.
        if let Some(prior) = self
            .ctx
            .registry
            .register(agent_id.clone(), self.sender.clone())
        {
            info!(agent_id = %agent_id, "superseding prior session");
            prior.send(SessionCommand::Superseded);
        }

        let caps: HashSet<CapabilityName> = capabilities
            .into_iter()
            .filter_map(|c| CapabilityName::try_new(c).ok())
            .collect();
        self.ctx
            .fsm
            .connect(agent_id.clone(), caps, endpoint_host)
            .await;

        info!(
            agent_id = %agent_id,
            session = %self.session_id,
            client_type = client_type.as_deref().unwrap_or("unknown"),
            protocol_version = protocol_version.unwrap_or(PROTOCOL_VERSION),
            "session identified"
        );
        self.agent_id = Some(agent_id.clone());

        let _ = self
            .push(&OutboundFrame::Identified {
                agent_id: agent_id.to_string(),
                protocol_version: PROTOCOL_VERSION,
            })
            .await;

        for task_id in in_flight {
            self.reconcile(task_id).await;
        }
        Ok(())
    }

    /// Reconnect reconciliation for one reported in-flight task
    async fn reconcile(&mut self, task_id: TaskId) {
        let Some(agent_id) = self.agent_id.clone() else {
            return;
        };

        let verdict = self.ctx.queue.recover_task(task_id).await;
        let frame = match verdict {
            Ok(RecoverOutcome::Continue(task))
                if task.assigned_to.as_ref() == Some(&agent_id) =>
            {
                match self.ctx.fsm.resume(agent_id.clone(), task_id).await {
                    Ok(()) => {
                        self.task_generations.insert(task_id, task.generation);
                        OutboundFrame::TaskContinue {
                            task_id,
                            generation: task.generation,
                        }
                    }
                    Err(e) => {
                        warn!(agent_id = %agent_id, %task_id, %e, "resume refused, cancelling");
                        Self::reclaim_quietly(&self.ctx.queue, task_id, "resume_refused").await;
                        OutboundFrame::TaskCancelled { task_id }
                    }
                }
            }
            // Assigned to someone else, already resettled, or unknown: the
            // agent drops the work.
            Ok(_) | Err(_) => OutboundFrame::TaskCancelled { task_id },
        };
        let _ = self.push(&frame).await;
    }

    async fn reclaim_quietly(queue: &TaskQueueHandle, task_id: TaskId, reason: &str) {
        match queue.reclaim_task(task_id, reason).await {
            Ok(_) | Err(QueueError::NotAssigned { .. } | QueueError::NotFound { .. }) => {}
            Err(e) => warn!(%task_id, %e, "reclaim failed"),
        }
    }

    /// Identified phase: full duplex until something closes us
    async fn identified_phase(&mut self) -> CloseReason {
        let mut ping = tokio::time::interval(Duration::from_millis(
            self.ctx.config.heartbeat_interval_ms.as_u64(),
        ));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            let pong_due = self.pong_due;
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        None | Some(SessionCommand::Close) => return CloseReason::HubClosed,
                        Some(SessionCommand::Superseded) => return CloseReason::Superseded,
                        Some(SessionCommand::Push(frame)) => {
                            if let OutboundFrame::TaskAssign { task_id, generation, .. } = &frame {
                                self.task_generations.insert(*task_id, *generation);
                            }
                            if self.push(&frame).await.is_err() {
                                return CloseReason::PeerClosed;
                            }
                        }
                    }
                }
                received = self.transport.recv() => {
                    let Some(received) = received else {
                        return CloseReason::PeerClosed;
                    };
                    match received {
                        Ok(text) => {
                            if let Some(reason) = self.handle_text(&text).await {
                                return reason;
                            }
                        }
                        Err(e) => {
                            debug!(session = %self.session_id, %e, "transport error");
                            return CloseReason::PeerClosed;
                        }
                    }
                }
                _ = ping.tick() => {
                    if self.push(&OutboundFrame::Ping).await.is_err() {
                        return CloseReason::PeerClosed;
                    }
                    self.pong_due = Some(
                        tokio::time::Instant::now()
                            + Duration::from_millis(
                                self.ctx.config.heartbeat_interval_ms.pong_deadline_ms(),
                            ),
                    );
                }
                () = async { tokio::time::sleep_until(pong_due.unwrap()).await }, if pong_due.is_some() => {
                    self.pong_due = None;
                    self.missed_pongs += 1;
                    if self.missed_pongs >= 2 {
                        warn!(session = %self.session_id, "pong watchdog expired twice, closing");
                        return CloseReason::HeartbeatLost;
                    }
                }
            }
        }
    }

    /// Decodes and dispatches one inbound frame; `Some` means close
    async fn handle_text(&mut self, text: &str) -> Option<CloseReason> {
        let frame = match parse_inbound(text) {
            Ok(frame) => frame,
            Err(e) => return self.violation(&e.to_string()).await,
        };
        self.dispatch(frame).await
    }

    async fn dispatch(&mut self, frame: InboundFrame) -> Option<CloseReason> {
        let agent_id = self.agent_id.clone()?;

        match frame {
            InboundFrame::Identify { .. } => {
                return self.violation("duplicate identify").await;
            }
            InboundFrame::TaskAccepted { task_id } => {
                match self.ctx.fsm.accept(agent_id.clone(), task_id).await {
                    Ok(()) => {
                        self.ctx.bus.publish(
                            topic::TASKS,
                            event::TASK_ACCEPT,
                            json!({ "task_id": task_id, "agent_id": agent_id }),
                        );
                    }
                    Err(e) => debug!(%task_id, %e, "accept ignored"),
                }
            }
            InboundFrame::TaskRejected { task_id, reason } => {
                let reason = reason.unwrap_or_else(|| "unspecified".to_string());
                if let Err(e) = self
                    .ctx
                    .fsm
                    .reject(agent_id.clone(), task_id, &reason)
                    .await
                {
                    debug!(%task_id, %e, "reject ignored");
                }
            }
            InboundFrame::TaskProgress { task_id } => {
                self.ctx.queue.update_progress(task_id);
            }
            InboundFrame::TaskComplete {
                task_id,
                generation,
                result,
                tokens_used,
                verification_report,
            } => {
                let outcome = CompletionOutcome {
                    result,
                    tokens_used,
                    verification_report,
                };
                match self
                    .ctx
                    .queue
                    .complete_task(task_id, generation, outcome)
                    .await
                {
                    Ok(_) => {
                        self.task_generations.remove(&task_id);
                        if let Err(e) = self.ctx.fsm.finish(agent_id.clone(), task_id, false).await
                        {
                            debug!(%task_id, %e, "finish after complete ignored");
                        }
                    }
                    // Zombie result from a fenced-out assignment: drop
                    // silently.
                    Err(QueueError::StaleGeneration { .. }) => {
                        debug!(%task_id, %generation, "stale completion dropped");
                    }
                    Err(e) => debug!(%task_id, %e, "completion ignored"),
                }
            }
            InboundFrame::TaskFailed {
                task_id,
                generation,
                reason,
            } => {
                match self.ctx.queue.fail_task(task_id, generation, reason).await {
                    Ok(_) => {
                        self.task_generations.remove(&task_id);
                        if let Err(e) = self.ctx.fsm.finish(agent_id.clone(), task_id, false).await
                        {
                            debug!(%task_id, %e, "finish after failure ignored");
                        }
                    }
                    Err(QueueError::StaleGeneration { .. }) => {
                        debug!(%task_id, %generation, "stale failure dropped");
                    }
                    Err(e) => debug!(%task_id, %e, "failure ignored"),
                }
            }
            InboundFrame::TaskRecovering { task_id, .. } => {
                self.reconcile(task_id).await;
            }
            InboundFrame::WakeResult {
                task_id,
                status,
                attempt,
                error,
            } => {
                if status == "failed" && attempt.unwrap_or(1) >= MAX_WAKE_ATTEMPTS {
                    warn!(%task_id, error = error.as_deref().unwrap_or(""), "wake exhausted, reclaiming");
                    Self::reclaim_quietly(&self.ctx.queue, task_id, "wake_failed").await;
                }
                let _ = self.push(&OutboundFrame::WakeAck { task_id }).await;
            }
            InboundFrame::ResourceReport { metrics } => {
                self.ctx.metrics.record_resources(&agent_id, &metrics).await;
            }
            InboundFrame::Ping => {
                let _ = self.push(&OutboundFrame::Pong).await;
            }
            InboundFrame::Pong => {
                self.missed_pongs = 0;
                self.pong_due = None;
                self.ctx.fsm.heartbeat(agent_id);
            }
        }
        None
    }

    async fn shutdown(mut self, reason: CloseReason) {
        debug!(session = %self.session_id, ?reason, "session closing");
        self.transport.close().await;

        if let Some(agent_id) = self.agent_id.take() {
            if reason == CloseReason::Superseded {
                // The replacing session owns the registry entry and the FSM
                // state now; touching either would clobber it.
                return;
            }
            self.ctx.registry.deregister(&agent_id, self.session_id);
            self.ctx.fsm.disconnect(agent_id).await;
        }
    }
}

/// In-process transport over a pair of channels
///
/// Used by tests and by embedders that already have their own socket
/// handling.
pub struct ChannelTransport {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
}

/// The peer half of a [`ChannelTransport`]
pub struct ChannelPeer {
    /// Frames the peer sends to the hub
    pub to_hub: mpsc::Sender<String>,
    /// Frames the hub pushed to the peer
    pub from_hub: mpsc::Receiver<String>,
}

/// Builds a connected transport/peer pair
#[must_use]
pub fn channel_transport(buffer: usize) -> (ChannelTransport, ChannelPeer) {
    let (to_hub, inbound) = mpsc::channel(buffer);
    let (outbound, from_hub) = mpsc::channel(buffer);
    (
        ChannelTransport { inbound, outbound },
        ChannelPeer { to_hub, from_hub },
    )
}

#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::new("peer receiver dropped"))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
