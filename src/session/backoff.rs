//! Durable reconnect cooldown after repeated protocol violations
//!
//! A session closed for `too_many_violations` records an offense keyed by
//! agent id. Reconnects inside the cooldown window are refused with
//! `retry_after_s`; each subsequent offense climbs the ladder.

use crate::domain_types::EpochMillis;
use crate::storage::{KvTable, StorageResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackoffRecord {
    offense_count: u32,
    until: EpochMillis,
}

/// Violation cooldown ledger over the `session_backoff` table
#[derive(Clone)]
pub struct ViolationBackoff {
    kv: KvTable,
    ladder_ms: Vec<u64>,
}

impl ViolationBackoff {
    /// Builds the ledger over its durable table
    #[must_use]
    pub fn new(kv: KvTable, ladder_ms: Vec<u64>) -> Self {
        Self { kv, ladder_ms }
    }

    fn rung(&self, offense: u32) -> u64 {
        let idx = offense.saturating_sub(1) as usize;
        self.ladder_ms
            .get(idx)
            .or_else(|| self.ladder_ms.last())
            .copied()
            .unwrap_or(30_000)
    }

    /// Seconds the agent must still wait, if it is cooling down
    ///
    /// # Errors
    /// Propagates storage failures; callers treat those as "no cooldown"
    /// and log.
    pub async fn remaining_cooldown_s(&self, agent_id: &str) -> StorageResult<Option<u64>> {
        let Some(record) = self.kv.get::<BackoffRecord>(agent_id).await? else {
            return Ok(None);
        };
        let now = EpochMillis::now();
        if record.until > now {
            Ok(Some(now.elapsed_until(record.until).div_ceil(1_000)))
        } else {
            Ok(None)
        }
    }

    /// Records one offense and returns the cooldown applied, in ms
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn record_offense(&self, agent_id: &str) -> StorageResult<u64> {
        let offense_count = self
            .kv
            .get::<BackoffRecord>(agent_id)
            .await?
            .map_or(0, |r| r.offense_count)
            + 1;

        let cooldown_ms = self.rung(offense_count);
        let record = BackoffRecord {
            offense_count,
            until: EpochMillis::now().plus(cooldown_ms),
        };
        self.kv.insert(agent_id, &record).await?;
        Ok(cooldown_ms)
    }

    /// Clears an agent's ledger entry (operator action)
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn clear(&self, agent_id: &str) -> StorageResult<bool> {
        self.kv.delete(agent_id).await
    }
}
