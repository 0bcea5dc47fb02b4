//! Wire protocol frames for agent sessions
//!
//! One JSON object per message frame, discriminated by a `type` string.
//! Unknown additive fields are ignored; unknown `type` values and
//! structurally malformed frames count as session violations. Responses
//! are always built from these typed structures, never ad-hoc JSON.

use crate::domain_types::{EpochMillis, Generation, RoutingDecision, TaskId};
use crate::queue::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Hard ceiling on a single frame
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

const MAX_TOKEN_CHARS: usize = 512;
const MAX_REASON_CHARS: usize = 2_000;
const MAX_STATUS_CHARS: usize = 64;
const MAX_CAPABILITIES: usize = 64;

/// Frame decode/validation failures; each one is a session violation
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {size} bytes (max {MAX_FRAME_BYTES})")]
    TooLarge { size: usize },

    #[error("malformed frame: {detail}")]
    Malformed { detail: String },

    #[error("invalid frame field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Frames an agent sends to the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Identify {
        agent_id: String,
        token: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        client_type: Option<String>,
        #[serde(default)]
        protocol_version: Option<u32>,
        #[serde(default)]
        endpoint_host: Option<String>,
        /// Task ids the agent believes it still holds, for reconnect
        /// reconciliation
        #[serde(default)]
        in_flight: Vec<TaskId>,
    },
    TaskAccepted {
        task_id: TaskId,
    },
    TaskRejected {
        task_id: TaskId,
        #[serde(default)]
        reason: Option<String>,
    },
    TaskProgress {
        task_id: TaskId,
    },
    TaskComplete {
        task_id: TaskId,
        generation: Generation,
        result: Value,
        #[serde(default)]
        tokens_used: Option<u64>,
        #[serde(default)]
        verification_report: Option<Value>,
    },
    TaskFailed {
        task_id: TaskId,
        generation: Generation,
        reason: String,
    },
    TaskRecovering {
        task_id: TaskId,
        #[serde(default)]
        last_status: Option<String>,
    },
    WakeResult {
        task_id: TaskId,
        status: String,
        #[serde(default)]
        attempt: Option<u32>,
        #[serde(default)]
        error: Option<String>,
    },
    ResourceReport {
        #[serde(default)]
        metrics: HashMap<String, Value>,
    },
    Ping,
    Pong,
}

/// Frames the hub pushes to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Identified {
        agent_id: String,
        protocol_version: u32,
    },
    TaskAssign {
        task_id: TaskId,
        description: String,
        metadata: HashMap<String, Value>,
        generation: Generation,
        assigned_at: Option<EpochMillis>,
        needed_capabilities: Vec<String>,
        depends_on: Vec<TaskId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        routing_decision: Option<RoutingDecision>,
        max_retries: u32,
        retry_count: u32,
    },
    TaskContinue {
        task_id: TaskId,
        generation: Generation,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    WakeAck {
        task_id: TaskId,
    },
    Ping,
    Pong,
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_s: Option<u64>,
    },
}

impl OutboundFrame {
    /// The assignment push carrying everything the agent needs to start
    #[must_use]
    pub fn assign(task: &Task) -> Self {
        Self::TaskAssign {
            task_id: task.id,
            description: task.description.clone(),
            metadata: task.metadata.clone(),
            generation: task.generation,
            assigned_at: task.assigned_at,
            needed_capabilities: task
                .needed_capabilities
                .iter()
                .map(ToString::to_string)
                .collect(),
            depends_on: task.depends_on.iter().copied().collect(),
            repo: task.repo.clone(),
            routing_decision: task.routing_decision.clone(),
            max_retries: task.max_retries,
            retry_count: task.retry_count,
        }
    }

    /// Serializes the frame for the wire
    #[must_use]
    pub fn encode(&self) -> String {
        // The frame enums only contain JSON-representable data.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","error":"encode"}"#.to_string())
    }
}

fn bounded(field: &'static str, value: &str, max: usize) -> Result<(), FrameError> {
    if value.chars().count() > max {
        Err(FrameError::Invalid {
            field,
            reason: format!("exceeds {max} characters"),
        })
    } else {
        Ok(())
    }
}

/// Decodes and validates one inbound frame
///
/// # Errors
/// `FrameError` on oversized, undecodable, or out-of-bounds frames.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, FrameError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge { size: text.len() });
    }

    let frame: InboundFrame = serde_json::from_str(text).map_err(|e| FrameError::Malformed {
        detail: e.to_string(),
    })?;

    match &frame {
        InboundFrame::Identify {
            token,
            capabilities,
            ..
        } => {
            bounded("token", token, MAX_TOKEN_CHARS)?;
            if capabilities.len() > MAX_CAPABILITIES {
                return Err(FrameError::Invalid {
                    field: "capabilities",
                    reason: format!("more than {MAX_CAPABILITIES} entries"),
                });
            }
        }
        InboundFrame::TaskRejected {
            reason: Some(reason),
            ..
        } => bounded("reason", reason, MAX_REASON_CHARS)?,
        InboundFrame::TaskFailed { reason, .. } => bounded("reason", reason, MAX_REASON_CHARS)?,
        InboundFrame::TaskRecovering {
            last_status: Some(status),
            ..
        } => bounded("last_status", status, MAX_STATUS_CHARS)?,
        InboundFrame::WakeResult { status, .. } => bounded("status", status, MAX_STATUS_CHARS)?,
        _ => {}
    }
    Ok(frame)
}
