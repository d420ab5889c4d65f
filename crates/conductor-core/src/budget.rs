//! Run budgets and duration (de)serialization helpers.
//!
//! A [`RunBudget`] caps one orchestration run three ways: turn count, per-turn
//! reasoner timeout, and total wall clock. All three are immutable for the
//! run's duration; elapsed/remaining bookkeeping lives with the orchestrator,
//! which measures from a monotonic start instant.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde support for `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for `Duration` as integer seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Caps for one orchestration run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunBudget {
    /// Maximum number of turns (reasoner invocations) before the run returns
    /// the max-turns message.
    pub max_turns: u32,

    /// Timeout handed to the reasoner client for a single call.
    #[serde(with = "duration_ms")]
    pub per_turn_timeout: Duration,

    /// Total wall-clock budget for the run, measured from a monotonic start.
    #[serde(with = "duration_ms")]
    pub total_budget: Duration,
}

impl RunBudget {
    pub fn new(max_turns: u32, per_turn_timeout: Duration, total_budget: Duration) -> Self {
        Self {
            max_turns,
            per_turn_timeout,
            total_budget,
        }
    }

    /// Per-turn timeout clamped to what is left of the wall clock.
    ///
    /// Keeps a late reasoner call from overshooting the total budget by more
    /// than the remaining window.
    pub fn effective_turn_timeout(&self, elapsed: Duration) -> Duration {
        let remaining = self.total_budget.saturating_sub(elapsed);
        self.per_turn_timeout.min(remaining)
    }

    /// True once the wall clock is spent.
    pub fn wall_clock_exceeded(&self, elapsed: Duration) -> bool {
        elapsed > self.total_budget
    }

    /// True once `turns_used` exhausts the turn allowance.
    pub fn turns_exhausted(&self, turns_used: u32) -> bool {
        turns_used >= self.max_turns
    }
}

impl Default for RunBudget {
    fn default() -> Self {
        Self {
            max_turns: 8,
            per_turn_timeout: Duration::from_secs(30),
            total_budget: Duration::from_secs(120),
        }
    }
}
