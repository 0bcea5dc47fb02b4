//! Core domain types shared across hub components
//!
//! Strongly-typed identifiers and values used by the queue, scheduler, agent
//! state machine, and sessions. Newtypes prevent primitive obsession at the
//! public seams: a `TaskId` can never be confused with an `AgentId`, and a
//! `Generation` can only move forward.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a task, generated at submit time.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Agent identifier, chosen by the agent at identify time.
///
/// Agents name themselves (`"agent-red"`, `"builder-3"`); the hub only
/// requires the name to be non-empty and bounded.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentId(String);

impl AgentId {
    /// Borrows the agent name
    #[must_use]
    pub fn as_str(&self) -> &str {
        let inner: &str = self.as_ref();
        inner
    }
}

/// Capability name declared by an agent or required by a task
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct CapabilityName(String);

/// Monotonic fence token, bumped on every assignment, retry, and reclaim.
///
/// A completion or failure frame carrying a stale generation is rejected;
/// this is how at-most-one-live-assignment survives reconnect races.
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct Generation(u64);

impl Generation {
    /// The initial generation of a freshly submitted task
    #[must_use]
    pub fn zero() -> Self {
        Self::new(0)
    }

    /// The next generation in sequence
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.into_inner()
    }
}

/// Millisecond wall-clock epoch timestamp
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct EpochMillis(u64);

impl EpochMillis {
    /// Current wall-clock time
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self::new(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.into_inner()
    }

    /// This timestamp shifted forward by `millis`
    #[must_use]
    pub fn plus(self, millis: u64) -> Self {
        Self::new(self.into_inner().saturating_add(millis))
    }

    /// Milliseconds elapsed between `self` and a later timestamp
    #[must_use]
    pub fn elapsed_until(self, later: Self) -> u64 {
        later.into_inner().saturating_sub(self.into_inner())
    }
}

/// Task priority lane. Lower index schedules first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Projects the lane onto its integer index (0 is most urgent)
    #[must_use]
    pub fn as_index(self) -> u8 {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        write!(f, "{name}")
    }
}

impl FromStr for TaskPriority {
    type Err = UnknownPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(UnknownPriority {
                value: other.to_string(),
            }),
        }
    }
}

/// Error for unrecognised priority strings
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown priority: {value}")]
pub struct UnknownPriority {
    /// The rejected input
    pub value: String,
}

/// Routing tier resolved for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTier {
    Trivial,
    Standard,
    Complex,
}

impl RouteTier {
    /// The next tier up the fallback chain, if any
    #[must_use]
    pub fn escalate(self) -> Option<Self> {
        match self {
            Self::Trivial => Some(Self::Standard),
            Self::Standard => Some(Self::Complex),
            Self::Complex => None,
        }
    }
}

impl fmt::Display for RouteTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trivial => "trivial",
            Self::Standard => "standard",
            Self::Complex => "complex",
        };
        write!(f, "{name}")
    }
}

/// Execution target class for a routed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Sidecar,
    LocalModel,
    RemoteModel,
}

/// Routing decision attached to a task before assignment
///
/// Produced by the routing resolver and stored on the task so the assigned
/// agent knows where to execute the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target_type: RouteTarget,
    pub effective_tier: RouteTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_tier: Option<String>,
}

impl RoutingDecision {
    /// A capability-routed sidecar decision, used when the resolver signals
    /// fallback and the scheduler degrades to plain capability matching.
    #[must_use]
    pub fn degraded(tier: RouteTier, reason: &str) -> Self {
        Self {
            target_type: RouteTarget::Sidecar,
            effective_tier: tier,
            selected_endpoint: None,
            selected_model: None,
            fallback_used: true,
            candidate_count: None,
            classification_reason: Some(reason.to_string()),
            estimated_cost_tier: None,
        }
    }
}
