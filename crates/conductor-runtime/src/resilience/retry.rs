//! Bounded retry around fallible async operations.
//!
//! The wrapper owns attempt counting and backoff sleeps; it never changes the
//! error it returns. Callers always receive the operation's last error
//! unchanged, so they can still branch on the root cause. Stateless, so any
//! number of concurrent flows can share it, each with its own budget.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::BackoffPolicy;

/// Retry knobs for one call site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryOptions {
    /// Additional attempts after the first; 0 disables retries.
    pub max_retries: u32,

    /// Delay schedule between attempts.
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

impl RetryOptions {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffPolicy::fixed(std::time::Duration::ZERO),
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Run `operation`, retrying failures the classifier deems transient.
///
/// Invokes `operation` at most `max_retries + 1` times, sleeping
/// `backoff.delay_for_attempt(n)` after the n-th failed attempt. Stops early
/// when the classifier rejects an error or the cancellation token fires
/// during a backoff sleep; both paths return the last error unchanged.
pub async fn retry_with<T, E, F, Fut>(
    options: &RetryOptions,
    is_retryable: impl Fn(&E) -> bool,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt > options.max_retries {
                    if options.max_retries > 0 {
                        warn!(
                            attempts = attempt,
                            error = %error,
                            "giving up after exhausting retries"
                        );
                    }
                    return Err(error);
                }
                if !is_retryable(&error) {
                    debug!(error = %error, "error is not retryable, giving up");
                    return Err(error);
                }

                let delay = options.backoff.delay_for_attempt(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cancelled during backoff, abandoning remaining retries");
                        return Err(error);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
