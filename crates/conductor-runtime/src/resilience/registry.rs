//! Registry of per-tool circuit breakers.
//!
//! Breakers are created lazily on first access and memoized for the life of
//! the registry, so every caller asking for the same tool name shares one
//! breaker and one failure history. The registry also carries the per-tool
//! configuration profiles and the administrative surface (summary, reset).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use conductor_core::BreakerState;

use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};

/// Breaker configuration profiles: a default plus per-tool overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerProfiles {
    /// Applied to any tool without an explicit override.
    #[serde(default)]
    pub default: CircuitBreakerConfig,

    /// Per-tool overrides keyed by tool name.
    #[serde(default)]
    pub per_tool: BTreeMap<String, CircuitBreakerConfig>,
}

impl BreakerProfiles {
    /// Configuration a breaker for `name` should be built with.
    pub fn resolve(&self, name: &str) -> CircuitBreakerConfig {
        self.per_tool.get(name).cloned().unwrap_or_else(|| self.default.clone())
    }
}

/// Aggregate view over every breaker the registry has materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSummary {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub breakers: Vec<BreakerSnapshot>,
}

/// Lazily materializing store of named circuit breakers.
pub struct CircuitBreakerRegistry {
    profiles: BreakerProfiles,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(profiles: BreakerProfiles) -> Self {
        Self {
            profiles,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Breaker for `name`, creating it from the matching profile on first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return Arc::clone(existing);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.profiles.resolve(name)))),
        )
    }

    /// Breaker for `name` built with an explicit config instead of the
    /// profile table. First creation wins: later calls return the memoized
    /// breaker no matter what config they pass.
    pub fn breaker_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return Arc::clone(existing);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// Names of every breaker materialized so far.
    pub fn names(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }

    /// Aggregate state counts plus one snapshot per breaker.
    pub fn summary(&self) -> BreakerSummary {
        let snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .read()
            .values()
            .map(|breaker| breaker.snapshot())
            .collect();
        let count = |state: BreakerState| snapshots.iter().filter(|s| s.state == state).count();
        BreakerSummary {
            total: snapshots.len(),
            closed: count(BreakerState::Closed),
            open: count(BreakerState::Open),
            half_open: count(BreakerState::HalfOpen),
            breakers: snapshots,
        }
    }

    /// Force one breaker closed. Returns false if it was never materialized.
    pub fn reset(&self, name: &str) -> bool {
        let breaker = self.breakers.read().get(name).map(Arc::clone);
        match breaker {
            Some(breaker) => {
                breaker.force_closed();
                true
            }
            None => false,
        }
    }

    /// Force every materialized breaker closed. Returns how many were reset.
    pub fn reset_all(&self) -> usize {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().values().map(Arc::clone).collect();
        for breaker in &breakers {
            breaker.force_closed();
        }
        info!(count = breakers.len(), "all circuit breakers reset");
        breakers.len()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerProfiles::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn strict_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            half_open_probes: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_is_memoized_per_name() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.breaker("current_conditions");
        let second = registry.breaker("current_conditions");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.names(), vec!["current_conditions".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_tool_profile_overrides_default() {
        let mut per_tool = BTreeMap::new();
        per_tool.insert("run_forecast".to_string(), strict_config());
        let registry = CircuitBreakerRegistry::new(BreakerProfiles {
            default: CircuitBreakerConfig::default(),
            per_tool,
        });

        assert_eq!(registry.breaker("run_forecast").config(), &strict_config());
        assert_eq!(
            registry.breaker("aggregate_metrics").config(),
            &CircuitBreakerConfig::default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_with_explicit_config_first_creation_wins() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.breaker_with("run_forecast", strict_config());
        assert_eq!(first.config(), &strict_config());

        // Already materialized: the passed config is ignored.
        let second = registry.breaker_with("run_forecast", CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config(), &strict_config());

        // Plain lookup shares the same instance too.
        assert!(Arc::ptr_eq(&first, &registry.breaker("run_forecast")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_history_is_shared_across_lookups() {
        let registry = CircuitBreakerRegistry::new(BreakerProfiles {
            default: strict_config(),
            per_tool: BTreeMap::new(),
        });

        registry.breaker("current_conditions").record_failure();
        assert!(registry.breaker("current_conditions").admit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_counts_states() {
        let registry = CircuitBreakerRegistry::new(BreakerProfiles {
            default: strict_config(),
            per_tool: BTreeMap::new(),
        });
        registry.breaker("current_conditions").record_failure();
        registry.breaker("aggregate_metrics");

        let summary = registry.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.open, 1);
        assert_eq!(summary.closed, 1);
        assert_eq!(summary.half_open, 0);
        assert_eq!(summary.breakers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_one_breaker() {
        let registry = CircuitBreakerRegistry::new(BreakerProfiles {
            default: strict_config(),
            per_tool: BTreeMap::new(),
        });
        registry.breaker("current_conditions").record_failure();

        assert!(registry.reset("current_conditions"));
        assert!(registry.breaker("current_conditions").admit().is_ok());
        assert!(!registry.reset("never_materialized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_reports_count() {
        let registry = CircuitBreakerRegistry::default();
        registry.breaker("current_conditions");
        registry.breaker("aggregate_metrics");
        registry.breaker("run_forecast");

        assert_eq!(registry.reset_all(), 3);
        assert_eq!(registry.summary().open, 0);
    }
}
