//! Per-dependency circuit breaker.
//!
//! One breaker guards one named tool. After enough consecutive failures the
//! circuit opens and calls fail fast; after a reset window the next call is
//! let through as a recovery probe. Transitions are lazy: state is only
//! inspected and mutated when a call arrives, never by a background timer, so
//! an idle OPEN breaker stays OPEN until the next admission attempt.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use conductor_core::budget::duration_secs;
use conductor_core::BreakerState;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open before probing recovery (in seconds).
    #[serde(with = "duration_secs")]
    pub reset_timeout: Duration,

    /// Consecutive half-open successes needed to close the circuit; also the
    /// cap on concurrently admitted probes.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone)]
pub enum CircuitState {
    /// Normal operation.
    Closed { failures: u32 },

    /// Failing fast; no calls reach the dependency.
    Open { opened_at: Instant },

    /// Probing recovery with a bounded number of calls.
    HalfOpen { successes: u32, in_flight: u32 },
}

impl CircuitState {
    /// Plain state tag for result records and summaries.
    pub fn tag(&self) -> BreakerState {
        match self {
            CircuitState::Closed { .. } => BreakerState::Closed,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

/// Fast-fail rejection raised without invoking the dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRejection {
    /// Time until the reset window elapses and a probe would be admitted.
    /// Zero when the circuit is half-open but saturated with probes.
    pub retry_after: Duration,
}

/// Point-in-time view of one breaker, for summaries and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    /// Tool name the breaker guards.
    pub name: String,

    /// Current state tag.
    pub state: BreakerState,

    /// Consecutive failures while closed.
    pub consecutive_failures: u32,

    /// Consecutive successes while half-open.
    pub half_open_successes: u32,

    /// Milliseconds since the last state transition.
    pub in_state_ms: u64,

    /// Milliseconds since the last recorded failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_ms_ago: Option<u64>,

    /// Milliseconds until an open circuit would admit a probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    /// Static configuration the breaker was built with.
    pub config: CircuitBreakerConfig,
}

struct Inner {
    state: CircuitState,
    last_failure_at: Option<Instant>,
    last_transition_at: Instant,
}

/// Circuit breaker guarding one named dependency.
///
/// Outcome recording is atomic per breaker: the state lock is held only for
/// the transition itself, never across the guarded call.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed { failures: 0 },
                last_failure_at: None,
                last_transition_at: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to run one call against the dependency.
    ///
    /// Returns the state under which the call was admitted, or a fast-fail
    /// rejection. This is the only place the lazy OPEN → HALF_OPEN transition
    /// happens: an open breaker whose reset window has elapsed flips here, on
    /// access, and admits the caller as the first probe.
    pub fn admit(&self) -> Result<BreakerState, OpenRejection> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed { .. } => Ok(BreakerState::Closed),
            CircuitState::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen {
                        successes: 0,
                        in_flight: 1,
                    };
                    inner.last_transition_at = Instant::now();
                    info!(
                        tool = %self.name,
                        "circuit half-open, admitting recovery probe"
                    );
                    Ok(BreakerState::HalfOpen)
                } else {
                    Err(OpenRejection {
                        retry_after: self.config.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen {
                successes,
                in_flight,
            } => {
                if in_flight >= self.config.half_open_probes {
                    Err(OpenRejection {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.state = CircuitState::HalfOpen {
                        successes,
                        in_flight: in_flight + 1,
                    };
                    Ok(BreakerState::HalfOpen)
                }
            }
        }
    }

    /// Record a successful admitted call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen {
                successes,
                in_flight,
            } => {
                let successes = successes + 1;
                if successes >= self.config.half_open_probes {
                    inner.state = CircuitState::Closed { failures: 0 };
                    inner.last_transition_at = Instant::now();
                    info!(tool = %self.name, "circuit closed after successful recovery");
                } else {
                    inner.state = CircuitState::HalfOpen {
                        successes,
                        in_flight: in_flight.saturating_sub(1),
                    };
                }
            }
            CircuitState::Closed { .. } => {
                inner.state = CircuitState::Closed { failures: 0 };
            }
            // Stale outcome from before a transition; nothing to update.
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed admitted call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    inner.last_transition_at = Instant::now();
                    warn!(
                        tool = %self.name,
                        failures,
                        "circuit opened after repeated failures"
                    );
                } else {
                    inner.state = CircuitState::Closed { failures };
                }
            }
            CircuitState::HalfOpen { .. } => {
                inner.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                inner.last_transition_at = Instant::now();
                warn!(tool = %self.name, "circuit reopened after failed recovery probe");
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Release an admitted call whose outcome will never be known.
    ///
    /// A cancelled in-flight call must count as neither success nor failure;
    /// for a half-open probe that also means giving its admission slot back.
    pub fn abandon(&self) {
        let mut inner = self.inner.lock();
        if let CircuitState::HalfOpen {
            successes,
            in_flight,
        } = inner.state
        {
            inner.state = CircuitState::HalfOpen {
                successes,
                in_flight: in_flight.saturating_sub(1),
            };
        }
    }

    /// Current state without triggering the lazy transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.clone()
    }

    /// Force the circuit closed (administrative escape hatch).
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock();
        let was = inner.state.tag();
        inner.state = CircuitState::Closed { failures: 0 };
        inner.last_transition_at = Instant::now();
        warn!(tool = %self.name, was = %was, "circuit force-closed by administrative reset");
    }

    /// Point-in-time snapshot for summaries.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let (consecutive_failures, half_open_successes, retry_after_ms) = match inner.state {
            CircuitState::Closed { failures } => (failures, 0, None),
            CircuitState::Open { opened_at } => {
                let remaining = self
                    .config
                    .reset_timeout
                    .saturating_sub(opened_at.elapsed());
                (0, 0, Some(remaining.as_millis() as u64))
            }
            CircuitState::HalfOpen { successes, .. } => (0, successes, None),
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state.tag(),
            consecutive_failures,
            half_open_successes,
            in_state_ms: inner.last_transition_at.elapsed().as_millis() as u64,
            last_failure_ms_ago: inner
                .last_failure_at
                .map(|at| at.elapsed().as_millis() as u64),
            retry_after_ms,
            config: self.config.clone(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default", CircuitBreakerConfig::default())
    }
}
