//! Hub configuration
//!
//! Validated tunables for heartbeats, timeouts, sweeps, and back-pressure.
//! Defaults match the operational profile the hub ships with; individual keys
//! can be overridden at startup from the durable `agentcom_config` table.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("unknown config key: {key}")]
    UnknownKey { key: String },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Ping interval for live sessions; the pong watchdog is a third of this
/// (10 s at the default 30 s interval).
#[nutype(
    validate(greater_or_equal = 1_000, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct HeartbeatIntervalMs(u64);

impl HeartbeatIntervalMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }

    /// The pong watchdog deadline derived from the ping interval
    #[must_use]
    pub fn pong_deadline_ms(&self) -> u64 {
        self.into_inner() / 3
    }
}

/// How long an assigned agent has to send `task_accepted` before reclaim
#[nutype(
    validate(greater_or_equal = 1_000, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60_000
)]
pub struct AcceptanceTimeoutMs(u64);

impl AcceptanceTimeoutMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Period of the scheduler's stuck-assignment scan
#[nutype(
    validate(greater_or_equal = 1_000, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct StuckSweepIntervalMs(u64);

impl StuckSweepIntervalMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// An assigned task with no progress for this long is reclaimed
#[nutype(
    validate(greater_or_equal = 10_000, less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 300_000
)]
pub struct StuckThresholdMs(u64);

impl StuckThresholdMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Period of the queued-task expiration scan
#[nutype(
    validate(greater_or_equal = 1_000, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60_000
)]
pub struct TtlSweepIntervalMs(u64);

impl TtlSweepIntervalMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Queued lifetime ceiling for non-trivial tasks
#[nutype(
    validate(greater_or_equal = 10_000, less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 600_000
)]
pub struct TaskTtlMs(u64);

impl TaskTtlMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Delay before retrying routing at the next tier up
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5_000
)]
pub struct FallbackWaitMs(u64);

impl FallbackWaitMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Per-session protocol violations tolerated inside one window
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct ViolationThreshold(u32);

impl ViolationThreshold {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Sliding window over which violations are counted
#[nutype(
    validate(greater_or_equal = 1_000, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60_000
)]
pub struct ViolationWindowMs(u64);

impl ViolationWindowMs {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Mailbox capacity for component actors
#[nutype(
    validate(greater_or_equal = 16, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 4_096
)]
pub struct MailboxCapacity(usize);

impl MailboxCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Per-subscriber event bus ring capacity
#[nutype(
    validate(greater_or_equal = 16, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1_024
)]
pub struct BusCapacity(usize);

impl BusCapacity {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Mailbox depth that triggers an `actor_mailbox_high` meta-event
pub const MAILBOX_HIGH_WATERMARK: usize = 1_000;

/// Longest accepted task description, in characters
pub const MAX_DESCRIPTION_CHARS: usize = 10_000;

/// Default retry budget for submitted tasks
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Failed wake attempts tolerated before the task is reclaimed
pub const MAX_WAKE_ATTEMPTS: u32 = 3;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Complete hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub heartbeat_interval_ms: HeartbeatIntervalMs,
    pub acceptance_timeout_ms: AcceptanceTimeoutMs,
    pub stuck_sweep_interval_ms: StuckSweepIntervalMs,
    pub stuck_threshold_ms: StuckThresholdMs,
    pub ttl_sweep_interval_ms: TtlSweepIntervalMs,
    pub task_ttl_ms: TaskTtlMs,
    pub fallback_wait_ms: FallbackWaitMs,
    pub violation_threshold: ViolationThreshold,
    pub violation_window_ms: ViolationWindowMs,
    /// Reconnect cooldown ladder applied after repeated violation closes
    pub backoff_ladder_ms: Vec<u64>,
    /// Agents whose last heartbeat is older than this get reaped
    pub agent_stale_after_ms: u64,
    pub mailbox_capacity: MailboxCapacity,
    pub bus_capacity: BusCapacity,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: HeartbeatIntervalMs::default(),
            acceptance_timeout_ms: AcceptanceTimeoutMs::default(),
            stuck_sweep_interval_ms: StuckSweepIntervalMs::default(),
            stuck_threshold_ms: StuckThresholdMs::default(),
            ttl_sweep_interval_ms: TtlSweepIntervalMs::default(),
            task_ttl_ms: TaskTtlMs::default(),
            fallback_wait_ms: FallbackWaitMs::default(),
            violation_threshold: ViolationThreshold::default(),
            violation_window_ms: ViolationWindowMs::default(),
            backoff_ladder_ms: vec![30_000, 60_000, 300_000],
            agent_stale_after_ms: 60_000,
            mailbox_capacity: MailboxCapacity::default(),
            bus_capacity: BusCapacity::default(),
        }
    }
}

impl HubConfig {
    /// Validates cross-field consistency
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` when related tunables contradict
    /// each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_ladder_ms.is_empty() {
            return Err(ConfigError::Validation {
                field: "backoff_ladder_ms".to_string(),
                reason: "must contain at least one rung".to_string(),
            });
        }

        if self.backoff_ladder_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::Validation {
                field: "backoff_ladder_ms".to_string(),
                reason: "rungs must be non-decreasing".to_string(),
            });
        }

        if self.stuck_threshold_ms.as_u64() <= self.stuck_sweep_interval_ms.as_u64() {
            return Err(ConfigError::Validation {
                field: "stuck_threshold_ms".to_string(),
                reason: "must exceed the stuck sweep interval".to_string(),
            });
        }

        if self.agent_stale_after_ms < self.heartbeat_interval_ms.as_u64() {
            return Err(ConfigError::Validation {
                field: "agent_stale_after_ms".to_string(),
                reason: "must be at least one heartbeat interval".to_string(),
            });
        }

        Ok(())
    }

    /// The cooldown for an agent's n-th violation offense (1-based).
    /// Offenses beyond the ladder reuse the top rung.
    #[must_use]
    pub fn backoff_for_offense(&self, offense: u32) -> u64 {
        let idx = offense.saturating_sub(1) as usize;
        self.backoff_ladder_ms
            .get(idx)
            .or_else(|| self.backoff_ladder_ms.last())
            .copied()
            .unwrap_or(30_000)
    }

    /// Applies one `key=value` override from the runtime config table.
    ///
    /// # Errors
    /// Returns `ConfigError::UnknownKey` or `ConfigError::InvalidValue`.
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("not an integer: {value}"),
            })
        }

        fn invalid(key: &str, err: impl std::fmt::Display) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                reason: err.to_string(),
            }
        }

        match key {
            "heartbeat_interval_ms" => {
                self.heartbeat_interval_ms = HeartbeatIntervalMs::try_new(parse_u64(key, value)?)
                    .map_err(|e| invalid(key, e))?;
            }
            "acceptance_timeout_ms" => {
                self.acceptance_timeout_ms = AcceptanceTimeoutMs::try_new(parse_u64(key, value)?)
                    .map_err(|e| invalid(key, e))?;
            }
            "stuck_sweep_interval_ms" => {
                self.stuck_sweep_interval_ms = StuckSweepIntervalMs::try_new(parse_u64(key, value)?)
                    .map_err(|e| invalid(key, e))?;
            }
            "stuck_threshold_ms" => {
                self.stuck_threshold_ms =
                    StuckThresholdMs::try_new(parse_u64(key, value)?).map_err(|e| invalid(key, e))?;
            }
            "ttl_sweep_interval_ms" => {
                self.ttl_sweep_interval_ms = TtlSweepIntervalMs::try_new(parse_u64(key, value)?)
                    .map_err(|e| invalid(key, e))?;
            }
            "task_ttl_ms" => {
                self.task_ttl_ms =
                    TaskTtlMs::try_new(parse_u64(key, value)?).map_err(|e| invalid(key, e))?;
            }
            "fallback_wait_ms" => {
                self.fallback_wait_ms =
                    FallbackWaitMs::try_new(parse_u64(key, value)?).map_err(|e| invalid(key, e))?;
            }
            "violation_threshold" => {
                let v = u32::try_from(parse_u64(key, value)?).map_err(|e| invalid(key, e))?;
                self.violation_threshold =
                    ViolationThreshold::try_new(v).map_err(|e| invalid(key, e))?;
            }
            "violation_window_ms" => {
                self.violation_window_ms = ViolationWindowMs::try_new(parse_u64(key, value)?)
                    .map_err(|e| invalid(key, e))?;
            }
            "agent_stale_after_ms" => {
                self.agent_stale_after_ms = parse_u64(key, value)?;
            }
            other => {
                return Err(ConfigError::UnknownKey {
                    key: other.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HubConfig::default().validate().unwrap();
    }

    #[test]
    fn backoff_ladder_caps_at_top_rung() {
        let config = HubConfig::default();
        assert_eq!(config.backoff_for_offense(1), 30_000);
        assert_eq!(config.backoff_for_offense(2), 60_000);
        assert_eq!(config.backoff_for_offense(3), 300_000);
        assert_eq!(config.backoff_for_offense(9), 300_000);
    }

    #[test]
    fn override_round_trips_through_strings() {
        let mut config = HubConfig::default();
        config
            .apply_override("acceptance_timeout_ms", "5000")
            .unwrap();
        assert_eq!(config.acceptance_timeout_ms.as_u64(), 5_000);

        assert!(config.apply_override("no_such_key", "1").is_err());
        assert!(config.apply_override("task_ttl_ms", "bogus").is_err());
    }

    #[test]
    fn inconsistent_sweep_settings_rejected() {
        let mut config = HubConfig::default();
        config.stuck_threshold_ms = StuckThresholdMs::try_new(10_000).unwrap();
        config.stuck_sweep_interval_ms = StuckSweepIntervalMs::try_new(30_000).unwrap();
        assert!(config.validate().is_err());
    }
}
