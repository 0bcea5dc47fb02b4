//! # AgentCom - Coordination Hub for Autonomous Agent Fleets
//!
//! AgentCom is the central hub for a fleet of autonomous worker agents that
//! pull work from a shared queue over persistent bidirectional connections.
//! It accepts tasks, persists them durably, decides which agent runs each
//! one, pushes assignments, tracks per-agent lifecycle, and reconciles
//! completions, retries, timeouts, disconnects, and crashes so that every
//! submitted task either reaches a terminal state or is visibly stuck.
//!
//! ## Core Components
//!
//! - [`queue`]: durable task queue with priority lanes, retries,
//!   dead-letter storage, and generation fencing
//! - [`agents`]: per-agent finite state machine with acceptance timeouts
//!   and disconnect reclamation
//! - [`scheduler`]: event-reactive matcher from queued tasks to idle,
//!   capable agents
//! - [`session`]: per-connection protocol endpoint with heartbeats,
//!   violation tracking, and reconnect recovery
//! - [`events`]: process-local publish/subscribe bus coupling the above
//! - [`storage`]: SQLite-backed keyed record tables with a durability
//!   fence
//!
//! ## Architecture
//!
//! Each long-lived component is a sequential actor owning its state and a
//! bounded mailbox; cross-component coupling goes over the event bus, never
//! through mutual calls. Every queue mutation is durable before its reply
//! returns, and a monotone per-task generation fences stale completions
//! from reconnecting or superseded agents.
//!
//! ```text
//! submitter --> Queue --(task_submitted)--> Scheduler --> Queue.assign
//!                 |                             ^
//!                 +--(task_assigned)--> Session | (agent_idle, task_completed, ...)
//!                                          |    |
//!                                        agent --+
//! ```

pub mod agents;
pub mod config;
pub mod domain_types;
pub mod events;
pub mod hub;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;

pub use crate::config::HubConfig;
pub use crate::domain_types::{
    AgentId, CapabilityName, EpochMillis, Generation, RouteTarget, RouteTier, RoutingDecision,
    TaskId, TaskPriority,
};
pub use crate::hub::{Hub, HubDeps, HubError, HubStorage};
pub use crate::queue::{SubmitParams, Task, TaskStatus};
