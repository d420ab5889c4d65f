//! Exponential backoff with bounded jitter.
//!
//! One policy is shared by every outbound call site (reasoner client, tool
//! dispatcher): `base_delay * 2^(attempt-1)` plus a uniform jitter draw.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use conductor_core::budget::duration_ms;

/// Delay schedule for retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry; doubles every retry after that.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// Upper bound of the uniform jitter added to every delay.
    #[serde(with = "duration_ms")]
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, jitter: Duration) -> Self {
        Self { base_delay, jitter }
    }

    /// Jitter-free schedule, useful for deterministic tests.
    pub fn fixed(base_delay: Duration) -> Self {
        Self {
            base_delay,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before retry `attempt` (1-based).
    ///
    /// Computes `base_delay * 2^(attempt-1) + uniform(0, jitter)`. Callers
    /// guard `attempt >= 1`; arithmetic saturates instead of overflowing on
    /// absurd attempt numbers.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        debug_assert!(attempt >= 1, "attempt numbers are 1-based");
        let attempt = attempt.max(1);
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        let exponential = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);

        let jitter_ms = self.jitter.as_millis() as u64;
        let draw = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exponential.saturating_add(Duration::from_millis(draw))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            jitter: Duration::from_millis(250),
        }
    }
}
