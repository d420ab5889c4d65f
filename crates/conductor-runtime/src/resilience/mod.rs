//! Resilience patterns for conductor-runtime.
//!
//! This module provides:
//! - Exponential backoff with jitter
//! - Retry with a pluggable retryability predicate
//! - Per-tool circuit breakers with lazy half-open recovery
//! - A registry memoizing one breaker per tool name

mod backoff;
mod circuit_breaker;
mod registry;
mod retry;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, OpenRejection,
};
pub use registry::{BreakerProfiles, BreakerSummary, CircuitBreakerRegistry};
pub use retry::{retry_with, RetryOptions};
