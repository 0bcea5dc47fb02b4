//! Per-agent state and guarded transitions
//!
//! The record is the pure half of the state machine: transitions validate
//! against the current state and held task, mutate in place, and leave the
//! queue and bus interactions to the registry actor.
//!
//! ```text
//!                      connect
//!         offline ---------------> idle
//!          ^                        |
//!          |                        | assign
//!          |                        v
//!          |                     assigned --accept--> working
//!          |                        |                     |
//!          |   disconnect /         | accept timeout      | complete
//!          |   failure              | (reclaim)           |  or fail
//!          |                        v                     v
//!          +------------------ (task requeued)      idle / blocked
//! ```

use crate::domain_types::{AgentId, CapabilityName, EpochMillis, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Assigned,
    Working,
    Blocked,
    Offline,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Assigned => "assigned",
            Self::Working => "working",
            Self::Blocked => "blocked",
            Self::Offline => "offline",
        };
        write!(f, "{name}")
    }
}

/// State machine errors
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("unknown agent: {agent_id}")]
    UnknownAgent { agent_id: AgentId },

    #[error("agent {agent_id} is {state}, cannot {action}")]
    InvalidTransition {
        agent_id: AgentId,
        state: AgentState,
        action: &'static str,
    },

    #[error("agent {agent_id} holds {held:?}, frame names {named}")]
    TaskMismatch {
        agent_id: AgentId,
        held: Option<TaskId>,
        named: TaskId,
    },

    #[error("agent state machine is gone")]
    Closed,
}

/// One tracked agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub capabilities: HashSet<CapabilityName>,
    /// Declared local-model endpoint host, used for routing affinity
    #[serde(default)]
    pub endpoint_host: Option<String>,
    pub fsm_state: AgentState,
    #[serde(default)]
    pub current_task_id: Option<TaskId>,
    pub connected_at: EpochMillis,
    pub last_state_change: EpochMillis,
    pub last_heartbeat: EpochMillis,
    #[serde(default)]
    pub accept_deadline: Option<EpochMillis>,
    /// Set when an acceptance timeout has fired for this agent
    #[serde(default)]
    pub slow_accept: bool,
}

impl AgentRecord {
    /// A freshly connected agent in `Idle`
    #[must_use]
    pub fn connected(
        agent_id: AgentId,
        capabilities: HashSet<CapabilityName>,
        endpoint_host: Option<String>,
    ) -> Self {
        let now = EpochMillis::now();
        Self {
            agent_id,
            capabilities,
            endpoint_host,
            fsm_state: AgentState::Idle,
            current_task_id: None,
            connected_at: now,
            last_state_change: now,
            last_heartbeat: now,
            accept_deadline: None,
            slow_accept: false,
        }
    }

    fn set_state(&mut self, state: AgentState) {
        self.fsm_state = state;
        self.last_state_change = EpochMillis::now();
    }

    fn require_task(&self, named: TaskId) -> Result<(), FsmError> {
        if self.current_task_id == Some(named) {
            Ok(())
        } else {
            Err(FsmError::TaskMismatch {
                agent_id: self.agent_id.clone(),
                held: self.current_task_id,
                named,
            })
        }
    }

    fn invalid(&self, action: &'static str) -> FsmError {
        FsmError::InvalidTransition {
            agent_id: self.agent_id.clone(),
            state: self.fsm_state,
            action,
        }
    }

    /// Whether this agent can take a new assignment
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.fsm_state == AgentState::Idle
    }

    /// Whether the agent's declared capabilities cover the requirement set
    #[must_use]
    pub fn covers(&self, needed: &HashSet<CapabilityName>) -> bool {
        needed.is_subset(&self.capabilities)
    }

    /// `idle -> assigned`; arms the acceptance deadline
    pub fn assign(&mut self, task_id: TaskId, deadline: EpochMillis) -> Result<(), FsmError> {
        if self.fsm_state != AgentState::Idle {
            return Err(self.invalid("assign"));
        }
        self.current_task_id = Some(task_id);
        self.accept_deadline = Some(deadline);
        self.set_state(AgentState::Assigned);
        Ok(())
    }

    /// `assigned -> working` on a matching `task_accepted`
    pub fn accept(&mut self, task_id: TaskId) -> Result<(), FsmError> {
        if self.fsm_state != AgentState::Assigned {
            return Err(self.invalid("accept"));
        }
        self.require_task(task_id)?;
        self.accept_deadline = None;
        self.set_state(AgentState::Working);
        Ok(())
    }

    /// `assigned -> idle` on rejection; the task goes back to the queue
    pub fn reject(&mut self, task_id: TaskId) -> Result<(), FsmError> {
        if self.fsm_state != AgentState::Assigned {
            return Err(self.invalid("reject"));
        }
        self.require_task(task_id)?;
        self.current_task_id = None;
        self.accept_deadline = None;
        self.set_state(AgentState::Idle);
        Ok(())
    }

    /// `working -> idle | blocked` after the task reached a terminal frame
    pub fn finish(&mut self, task_id: TaskId, blocked: bool) -> Result<(), FsmError> {
        if self.fsm_state != AgentState::Working {
            return Err(self.invalid("finish"));
        }
        self.require_task(task_id)?;
        self.current_task_id = None;
        self.set_state(if blocked {
            AgentState::Blocked
        } else {
            AgentState::Idle
        });
        Ok(())
    }

    /// Acceptance timeout fired; flags the agent and frees it
    pub fn accept_timed_out(&mut self) {
        self.current_task_id = None;
        self.accept_deadline = None;
        self.slow_accept = true;
        self.set_state(AgentState::Idle);
    }

    /// Declares the agent blocked on external input
    pub fn block(&mut self) -> Result<(), FsmError> {
        match self.fsm_state {
            AgentState::Idle | AgentState::Working => {
                // Blocked while working drops eligibility but keeps the
                // task; a disconnect still reclaims it.
                self.set_state(AgentState::Blocked);
                Ok(())
            }
            _ => Err(self.invalid("block")),
        }
    }

    /// Clears a blocked declaration
    pub fn unblock(&mut self) -> Result<(), FsmError> {
        if self.fsm_state != AgentState::Blocked {
            return Err(self.invalid("unblock"));
        }
        self.current_task_id = None;
        self.set_state(AgentState::Idle);
        Ok(())
    }

    /// Reconnect recovery: the queue confirmed the task is still assigned
    /// to this agent, so it resumes `working` without reassignment.
    pub fn resume(&mut self, task_id: TaskId) -> Result<(), FsmError> {
        match self.fsm_state {
            AgentState::Idle | AgentState::Assigned => {
                self.current_task_id = Some(task_id);
                self.accept_deadline = None;
                self.set_state(AgentState::Working);
                Ok(())
            }
            _ => Err(self.invalid("resume")),
        }
    }

    /// Connection closed; the caller reclaims any held task
    pub fn go_offline(&mut self) -> Option<TaskId> {
        let held = self.current_task_id.take();
        self.accept_deadline = None;
        self.set_state(AgentState::Offline);
        held
    }

    /// A new connection re-enters `idle`, refreshing declared capabilities
    pub fn reconnect(
        &mut self,
        capabilities: HashSet<CapabilityName>,
        endpoint_host: Option<String>,
    ) {
        let now = EpochMillis::now();
        self.capabilities = capabilities;
        self.endpoint_host = endpoint_host;
        self.current_task_id = None;
        self.accept_deadline = None;
        self.connected_at = now;
        self.last_heartbeat = now;
        self.set_state(AgentState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AgentRecord {
        AgentRecord::connected(
            AgentId::try_new("a1".to_string()).unwrap(),
            HashSet::new(),
            None,
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut rec = record();
        let task = TaskId::generate();
        assert!(rec.is_idle());

        rec.assign(task, EpochMillis::now().plus(60_000)).unwrap();
        assert_eq!(rec.fsm_state, AgentState::Assigned);
        assert!(rec.accept_deadline.is_some());

        rec.accept(task).unwrap();
        assert_eq!(rec.fsm_state, AgentState::Working);
        assert!(rec.accept_deadline.is_none());

        rec.finish(task, false).unwrap();
        assert!(rec.is_idle());
        assert_eq!(rec.current_task_id, None);
    }

    #[test]
    fn assign_requires_idle() {
        let mut rec = record();
        let task = TaskId::generate();
        rec.assign(task, EpochMillis::now()).unwrap();
        assert!(matches!(
            rec.assign(TaskId::generate(), EpochMillis::now()),
            Err(FsmError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn accept_checks_task_identity() {
        let mut rec = record();
        rec.assign(TaskId::generate(), EpochMillis::now()).unwrap();
        assert!(matches!(
            rec.accept(TaskId::generate()),
            Err(FsmError::TaskMismatch { .. })
        ));
    }

    #[test]
    fn timeout_flags_slow_accept() {
        let mut rec = record();
        rec.assign(TaskId::generate(), EpochMillis::now()).unwrap();
        rec.accept_timed_out();
        assert!(rec.is_idle());
        assert!(rec.slow_accept);
    }

    #[test]
    fn offline_surrenders_held_task() {
        let mut rec = record();
        let task = TaskId::generate();
        rec.assign(task, EpochMillis::now()).unwrap();
        rec.accept(task).unwrap();

        assert_eq!(rec.go_offline(), Some(task));
        assert_eq!(rec.fsm_state, AgentState::Offline);

        rec.reconnect(HashSet::new(), None);
        assert!(rec.is_idle());
    }

    #[test]
    fn blocked_agents_are_not_eligible() {
        let mut rec = record();
        rec.block().unwrap();
        assert!(!rec.is_idle());
        rec.unblock().unwrap();
        assert!(rec.is_idle());
    }

    #[test]
    fn resume_reenters_working_without_reassignment() {
        let mut rec = record();
        let task = TaskId::generate();
        rec.resume(task).unwrap();
        assert_eq!(rec.fsm_state, AgentState::Working);
        assert_eq!(rec.current_task_id, Some(task));
    }

    #[test]
    fn capability_cover_is_superset() {
        let cap = |s: &str| CapabilityName::try_new(s.to_string()).unwrap();
        let mut rec = record();
        rec.capabilities = [cap("code"), cap("review")].into_iter().collect();

        let needs: HashSet<_> = [cap("code")].into_iter().collect();
        assert!(rec.covers(&needs));

        let missing: HashSet<_> = [cap("deploy")].into_iter().collect();
        assert!(!rec.covers(&missing));
        assert!(rec.covers(&HashSet::new()));
    }
}
