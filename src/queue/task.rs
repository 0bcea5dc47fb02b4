//! Task records and their guarded state transitions
//!
//! The transition methods are the functional core of the queue: they
//! validate the status DAG and generation fences without touching storage,
//! so the actor can persist-then-publish around them and the properties can
//! be tested in isolation.
//!
//! Status DAG:
//! `queued -> assigned -> {completed, failed}`; `failed -> queued` (retry)
//! or `failed -> dead_letter`; `assigned -> queued` (reclaim);
//! `queued -> expired` (TTL sweep).

use crate::domain_types::{
    AgentId, CapabilityName, EpochMillis, Generation, RoutingDecision, TaskId, TaskPriority,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Most recent history entries retained per task
pub const HISTORY_CAP: usize = 50;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Completed,
    Failed,
    DeadLetter,
    Expired,
}

impl TaskStatus {
    /// Whether the task can never transition again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter | Self::Expired)
    }
}

/// Transition guard failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("operation not permitted in state {status:?}")]
    InvalidState { status: TaskStatus },

    #[error("stale generation: task is at {current}, caller supplied {supplied}")]
    StaleGeneration {
        current: Generation,
        supplied: Generation,
    },
}

/// One append-only history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: String,
    pub timestamp: EpochMillis,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// Validated submit parameters, shaped at the boundary before they reach
/// the queue actor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitParams {
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub complete_by: Option<EpochMillis>,
    #[serde(default)]
    pub needed_capabilities: HashSet<CapabilityName>,
    #[serde(default)]
    pub depends_on: HashSet<TaskId>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub assign_to: Option<AgentId>,
}

impl SubmitParams {
    /// Minimal params with just a description
    #[must_use]
    pub fn with_description(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// Terminal output reported with a completion frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_report: Option<Value>,
}

/// What `record_failure` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retry budget remains; the task went back to the queue
    Retried,
    /// Budget exhausted; the task belongs in the dead-letter store
    DeadLetter,
}

/// The unit of durable work tracked by the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_to: Option<AgentId>,
    #[serde(default)]
    pub assigned_at: Option<EpochMillis>,
    pub created_at: EpochMillis,
    pub updated_at: EpochMillis,
    #[serde(default)]
    pub complete_by: Option<EpochMillis>,
    pub generation: Generation,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub needed_capabilities: HashSet<CapabilityName>,
    #[serde(default)]
    pub depends_on: HashSet<TaskId>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub assign_to: Option<AgentId>,
    #[serde(default)]
    pub routing_decision: Option<RoutingDecision>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Task {
    /// Builds a freshly submitted task in `Queued` at generation zero
    #[must_use]
    pub fn from_submit(id: TaskId, params: SubmitParams, default_max_retries: u32) -> Self {
        let now = EpochMillis::now();
        let mut task = Self {
            id,
            description: params.description,
            metadata: params.metadata,
            priority: params.priority,
            status: TaskStatus::Queued,
            assigned_to: None,
            assigned_at: None,
            created_at: now,
            updated_at: now,
            complete_by: params.complete_by,
            generation: Generation::zero(),
            retry_count: 0,
            max_retries: params.max_retries.unwrap_or(default_max_retries),
            needed_capabilities: params.needed_capabilities,
            depends_on: params.depends_on,
            repo: params.repo,
            assign_to: params.assign_to,
            routing_decision: None,
            last_error: None,
            result: None,
            history: Vec::new(),
        };
        task.record("submitted", json!({ "priority": task.priority }), now);
        task
    }

    /// Appends a history entry, dropping the oldest past the cap
    pub fn record(&mut self, event: &str, details: Value, now: EpochMillis) {
        if self.history.len() >= HISTORY_CAP {
            self.history.remove(0);
        }
        self.history.push(HistoryEntry {
            event: event.to_string(),
            timestamp: now,
            details,
        });
    }

    fn require_status(&self, expected: TaskStatus) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError::InvalidState {
                status: self.status,
            })
        }
    }

    fn require_generation(&self, supplied: Generation) -> Result<(), TransitionError> {
        if self.generation == supplied {
            Ok(())
        } else {
            Err(TransitionError::StaleGeneration {
                current: self.generation,
                supplied,
            })
        }
    }

    /// `queued -> assigned`, bumping the generation fence
    pub fn begin_assignment(
        &mut self,
        agent: AgentId,
        complete_by: Option<EpochMillis>,
    ) -> Result<(), TransitionError> {
        self.require_status(TaskStatus::Queued)?;
        let now = EpochMillis::now();
        self.status = TaskStatus::Assigned;
        self.assigned_to = Some(agent.clone());
        self.assigned_at = Some(now);
        self.generation = self.generation.next();
        if complete_by.is_some() {
            self.complete_by = complete_by;
        }
        self.updated_at = now;
        self.record(
            "assigned",
            json!({ "agent_id": agent, "generation": self.generation }),
            now,
        );
        Ok(())
    }

    /// `assigned -> completed`, fenced by generation
    pub fn complete(
        &mut self,
        generation: Generation,
        outcome: CompletionOutcome,
    ) -> Result<(), TransitionError> {
        self.require_status(TaskStatus::Assigned)?;
        self.require_generation(generation)?;
        let now = EpochMillis::now();
        self.status = TaskStatus::Completed;
        self.result = Some(outcome.result);
        if let Some(tokens) = outcome.tokens_used {
            self.metadata
                .insert("tokens_used".to_string(), json!(tokens));
        }
        if let Some(report) = outcome.verification_report {
            self.metadata
                .insert("verification_report".to_string(), report);
        }
        self.assigned_to = None;
        self.assigned_at = None;
        self.updated_at = now;
        self.record("completed", json!({ "generation": generation }), now);
        Ok(())
    }

    /// Records a fenced failure; decides retry vs dead-letter.
    ///
    /// The budget check precedes the increment: `max_retries = 2` allows
    /// two retries and dead-letters on the third failure. On `Retried` the
    /// task is back in `Queued` with a fresh generation; on `DeadLetter`
    /// the caller moves the record to the dead-letter store.
    pub fn record_failure(
        &mut self,
        generation: Generation,
        error: &str,
    ) -> Result<FailureOutcome, TransitionError> {
        self.require_status(TaskStatus::Assigned)?;
        self.require_generation(generation)?;
        let now = EpochMillis::now();
        self.last_error = Some(error.to_string());
        self.updated_at = now;

        if self.retry_count >= self.max_retries {
            self.status = TaskStatus::DeadLetter;
            self.assigned_to = None;
            self.assigned_at = None;
            self.record(
                "dead_letter",
                json!({ "error": error, "retry_count": self.retry_count }),
                now,
            );
            Ok(FailureOutcome::DeadLetter)
        } else {
            self.retry_count += 1;
            self.status = TaskStatus::Queued;
            self.assigned_to = None;
            self.assigned_at = None;
            self.generation = self.generation.next();
            self.record(
                "retried",
                json!({ "error": error, "retry_count": self.retry_count }),
                now,
            );
            Ok(FailureOutcome::Retried)
        }
    }

    /// `assigned -> queued` with a fresh generation; timeout, disconnect,
    /// or explicit reclaim.
    pub fn reclaim(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.require_status(TaskStatus::Assigned)?;
        let now = EpochMillis::now();
        let previous_agent = self.assigned_to.take();
        self.assigned_at = None;
        self.status = TaskStatus::Queued;
        self.generation = self.generation.next();
        self.updated_at = now;
        self.record(
            "reclaimed",
            json!({ "reason": reason, "from": previous_agent }),
            now,
        );
        Ok(())
    }

    /// `queued -> expired`; TTL sweep
    pub fn expire(&mut self) -> Result<(), TransitionError> {
        self.require_status(TaskStatus::Queued)?;
        let now = EpochMillis::now();
        self.status = TaskStatus::Expired;
        self.updated_at = now;
        self.record("expired", Value::Null, now);
        Ok(())
    }

    /// `dead_letter -> queued` with a reset retry budget
    pub fn retry_from_dead_letter(&mut self) -> Result<(), TransitionError> {
        self.require_status(TaskStatus::DeadLetter)?;
        let now = EpochMillis::now();
        self.status = TaskStatus::Queued;
        self.retry_count = 0;
        self.generation = self.generation.next();
        self.updated_at = now;
        self.record("dead_letter_retry", Value::Null, now);
        Ok(())
    }

    /// Progress heartbeat; protects the task from the stuck sweep
    pub fn touch(&mut self) {
        self.updated_at = EpochMillis::now();
    }

    /// The `(priority, created_at, id)` key this task sorts under while
    /// queued
    #[must_use]
    pub fn priority_key(&self) -> (u8, u64, TaskId) {
        (
            self.priority.as_index(),
            self.created_at.as_u64(),
            self.id,
        )
    }
}
