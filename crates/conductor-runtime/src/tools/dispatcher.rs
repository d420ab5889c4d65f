//! Tool call dispatch.
//!
//! The dispatcher owns the closed table of tool handlers and the full
//! per-call pipeline: name resolution, cache probe, argument validation,
//! circuit-breaker admission, timeout, retry, and outcome recording. Every
//! failure mode becomes a structured [`ToolCallResult`]; `execute` never
//! returns an error to the orchestration loop, so one bad tool call can never
//! abort a run on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conductor_core::budget::duration_ms;
use conductor_core::{ToolCallRequest, ToolCallResult, ToolErrorKind, ToolFault, ToolSpec};

use crate::resilience::{retry_with, CircuitBreakerRegistry, RetryOptions};

use super::{ToolCacheConfig, ToolHandler, ToolId, ToolResultCache};

/// Per-tool call policy: how long one attempt may run and how often to retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolProfile {
    /// Wall-clock limit for a single handler attempt.
    #[serde(default = "default_call_timeout", with = "duration_ms")]
    pub call_timeout: Duration,

    /// Retry policy across attempts of the same call.
    #[serde(default = "RetryOptions::none")]
    pub retry: RetryOptions,
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ToolProfile {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
            retry: RetryOptions::none(),
        }
    }
}

/// Errors raised while assembling a dispatcher.
#[derive(Error, Debug)]
pub enum ToolSetupError {
    #[error("Failed to compile parameter schema for {tool}: {message}")]
    SchemaCompile { tool: ToolId, message: String },
}

/// Outcome of dispatching one tool call.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The call ran to a recorded result (success or structured failure).
    Completed(ToolCallResult),

    /// The run was cancelled mid-call; no outcome was recorded anywhere.
    Interrupted,
}

// Failure of one admitted call, before it is folded into a ToolCallResult.
enum CallFailure {
    Timeout(Duration),
    Execution(String),
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Timeout(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
            CallFailure::Execution(message) => f.write_str(message),
        }
    }
}

struct RegisteredTool {
    handler: Arc<dyn ToolHandler>,
    validator: jsonschema::Validator,
    profile: ToolProfile,
}

/// Closed dispatch table over the registered tools.
pub struct ToolDispatcher {
    tools: BTreeMap<ToolId, RegisteredTool>,
    registry: Arc<CircuitBreakerRegistry>,
    cache: Option<ToolResultCache>,
}

impl ToolDispatcher {
    pub fn builder() -> ToolDispatcherBuilder {
        ToolDispatcherBuilder::default()
    }

    /// Advertisement records for every registered tool.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.keys().map(ToolId::spec).collect()
    }

    /// The breaker registry backing this dispatcher (admin surface).
    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Execute one requested call through the full pipeline.
    pub async fn execute(
        &self,
        request: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let started = Instant::now();

        // Name resolution against the closed table. Unknown names never touch
        // a breaker: materializing breakers for hallucinated tools would let a
        // confused reasoner grow the registry without bound.
        let tool = match ToolId::parse(&request.tool).filter(|id| self.tools.contains_key(id)) {
            Some(id) => id,
            None => {
                warn!(tool = %request.tool, seq = request.seq, "unknown tool requested");
                return DispatchOutcome::Completed(ToolCallResult::failure(
                    request,
                    ToolFault::new(
                        ToolErrorKind::UnknownTool,
                        format!("tool \"{}\" is not in the dispatch table", request.tool),
                    ),
                    started.elapsed(),
                    None,
                ));
            }
        };
        let registered = &self.tools[&tool];

        if let Some(cache) = &self.cache {
            if let Some(payload) = cache.get(tool, &request.arguments).await {
                debug!(tool = %tool, seq = request.seq, "tool cache hit");
                let mut result =
                    ToolCallResult::success(request, payload, started.elapsed(), None);
                result.cached = true;
                return DispatchOutcome::Completed(result);
            }
        }

        // Malformed arguments are the reasoner's fault, not the dependency's,
        // so they are rejected before admission and record nothing on the
        // breaker.
        let violations: Vec<String> = registered
            .validator
            .iter_errors(&request.arguments)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        if !violations.is_empty() {
            debug!(tool = %tool, seq = request.seq, "tool arguments rejected");
            return DispatchOutcome::Completed(ToolCallResult::failure(
                request,
                ToolFault::new(ToolErrorKind::InvalidArgs, violations.join("; ")),
                started.elapsed(),
                None,
            ));
        }

        let breaker = self.registry.breaker(tool.name());
        let admitted = match breaker.admit() {
            Ok(state) => state,
            Err(rejection) => {
                debug!(
                    tool = %tool,
                    seq = request.seq,
                    retry_after_ms = rejection.retry_after.as_millis() as u64,
                    "tool call rejected by open circuit"
                );
                return DispatchOutcome::Completed(ToolCallResult::failure(
                    request,
                    ToolFault::new(
                        ToolErrorKind::CircuitOpen,
                        format!(
                            "circuit for \"{}\" is open; retry after {}ms",
                            tool,
                            rejection.retry_after.as_millis()
                        ),
                    ),
                    started.elapsed(),
                    Some(breaker.state().tag()),
                ));
            }
        };

        let attempt_timeout = registered.profile.call_timeout;
        let handler = Arc::clone(&registered.handler);
        let arguments = request.arguments.clone();
        let call = retry_with(
            &registered.profile.retry,
            |_: &CallFailure| true,
            cancel,
            || {
                let handler = Arc::clone(&handler);
                let arguments = arguments.clone();
                async move {
                    match tokio::time::timeout(attempt_timeout, handler.call(arguments)).await {
                        Ok(Ok(payload)) => Ok(payload),
                        Ok(Err(source)) => Err(CallFailure::Execution(format!("{source:#}"))),
                        Err(_) => Err(CallFailure::Timeout(attempt_timeout)),
                    }
                }
            },
        );

        // Cancellation wins the race, so an interrupted call records neither
        // success nor failure and a half-open probe slot is handed back.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                breaker.abandon();
                debug!(tool = %tool, seq = request.seq, "tool call interrupted by cancellation");
                return DispatchOutcome::Interrupted;
            }
            outcome = call => outcome,
        };

        match outcome {
            Ok(payload) => {
                breaker.record_success();
                if let Some(cache) = &self.cache {
                    cache.insert(tool, &request.arguments, payload.clone()).await;
                }
                DispatchOutcome::Completed(ToolCallResult::success(
                    request,
                    payload,
                    started.elapsed(),
                    Some(admitted),
                ))
            }
            Err(failure) => {
                breaker.record_failure();
                let kind = match &failure {
                    CallFailure::Timeout(_) => ToolErrorKind::Timeout,
                    CallFailure::Execution(_) => ToolErrorKind::Execution,
                };
                warn!(tool = %tool, seq = request.seq, error = %failure, "tool call failed");
                DispatchOutcome::Completed(ToolCallResult::failure(
                    request,
                    ToolFault::new(kind, failure.to_string()),
                    started.elapsed(),
                    Some(admitted),
                ))
            }
        }
    }
}

/// Builder assembling handlers, profiles, breakers, and the optional cache.
#[derive(Default)]
pub struct ToolDispatcherBuilder {
    handlers: BTreeMap<ToolId, Arc<dyn ToolHandler>>,
    profiles: BTreeMap<ToolId, ToolProfile>,
    default_profile: ToolProfile,
    registry: Option<Arc<CircuitBreakerRegistry>>,
    cache: Option<ToolCacheConfig>,
}

impl ToolDispatcherBuilder {
    /// Register a handler for one tool id.
    pub fn handler(mut self, tool: ToolId, handler: impl ToolHandler + 'static) -> Self {
        self.handlers.insert(tool, Arc::new(handler));
        self
    }

    /// Call policy applied to tools without an explicit profile.
    pub fn default_profile(mut self, profile: ToolProfile) -> Self {
        self.default_profile = profile;
        self
    }

    /// Call policy for one tool.
    pub fn profile(mut self, tool: ToolId, profile: ToolProfile) -> Self {
        self.profiles.insert(tool, profile);
        self
    }

    /// Share a breaker registry (defaults to a fresh one with default profiles).
    pub fn registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enable result caching per the given configuration.
    pub fn cache(mut self, config: ToolCacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn build(self) -> Result<ToolDispatcher, ToolSetupError> {
        let mut tools = BTreeMap::new();
        for (tool, handler) in self.handlers {
            let schema = tool.parameter_schema();
            let validator = jsonschema::options().build(&schema).map_err(|e| {
                ToolSetupError::SchemaCompile {
                    tool,
                    message: e.to_string(),
                }
            })?;
            let profile = self
                .profiles
                .get(&tool)
                .cloned()
                .unwrap_or_else(|| self.default_profile.clone());
            tools.insert(
                tool,
                RegisteredTool {
                    handler,
                    validator,
                    profile,
                },
            );
        }
        Ok(ToolDispatcher {
            tools,
            registry: self.registry.unwrap_or_default(),
            cache: self.cache.as_ref().and_then(ToolResultCache::from_config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerProfiles, CircuitBreakerConfig};
    use crate::tools::handler_fn;
    use conductor_core::BreakerState;
    use futures::future::BoxFuture;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ToolHandler for CountingHandler {
        async fn call(&self, _arguments: Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("upstream telemetry store unavailable");
            }
            Ok(json!({ "temperature_c": 18.2 }))
        }
    }

    fn request(tool: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            seq: 1,
            tool: tool.to_string(),
            arguments,
        }
    }

    fn strict_registry() -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::new(BreakerProfiles {
            default: CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(30),
                half_open_probes: 2,
            },
            per_tool: BTreeMap::new(),
        }))
    }

    fn completed(outcome: DispatchOutcome) -> ToolCallResult {
        match outcome {
            DispatchOutcome::Completed(result) => result,
            DispatchOutcome::Interrupted => panic!("call was interrupted"),
        }
    }

    #[tokio::test]
    async fn test_successful_call_returns_payload() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::CurrentConditions,
                CountingHandler {
                    calls: Arc::clone(&calls),
                    fail: false,
                },
            )
            .build()
            .unwrap();

        let result = completed(
            dispatcher
                .execute(
                    &request("current_conditions", json!({ "station": "KSEA" })),
                    &CancellationToken::new(),
                )
                .await,
        );

        assert!(result.success);
        assert_eq!(result.payload.as_ref().unwrap()["temperature_c"], 18.2);
        assert_eq!(result.breaker_state, Some(BreakerState::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_never_reaches_a_breaker() {
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::CurrentConditions,
                CountingHandler {
                    calls: Arc::new(AtomicU32::new(0)),
                    fail: false,
                },
            )
            .build()
            .unwrap();

        let result = completed(
            dispatcher
                .execute(
                    &request("stream_conditions", json!({})),
                    &CancellationToken::new(),
                )
                .await,
        );

        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, ToolErrorKind::UnknownTool);
        assert!(result.error.as_ref().unwrap().message.contains("stream_conditions"));
        // No breaker materialized for the bogus name.
        assert!(dispatcher.registry().names().is_empty());
    }

    #[tokio::test]
    async fn test_registered_enum_tool_without_handler_is_unknown() {
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::CurrentConditions,
                CountingHandler {
                    calls: Arc::new(AtomicU32::new(0)),
                    fail: false,
                },
            )
            .build()
            .unwrap();

        let result = completed(
            dispatcher
                .execute(
                    &request("run_forecast", json!({ "metric": "temperature_c" })),
                    &CancellationToken::new(),
                )
                .await,
        );
        assert_eq!(result.error.unwrap().kind, ToolErrorKind::UnknownTool);
    }

    #[tokio::test]
    async fn test_invalid_arguments_skip_handler_and_breaker() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::AggregateMetrics,
                CountingHandler {
                    calls: Arc::clone(&calls),
                    fail: false,
                },
            )
            .build()
            .unwrap();

        // window_hours above the schema maximum.
        let result = completed(
            dispatcher
                .execute(
                    &request(
                        "aggregate_metrics",
                        json!({ "metric": "wind_kph", "window_hours": 9000, "statistic": "max" }),
                    ),
                    &CancellationToken::new(),
                )
                .await,
        );

        assert_eq!(result.error.as_ref().unwrap().kind, ToolErrorKind::InvalidArgs);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(dispatcher.registry().names().is_empty());
    }

    #[tokio::test]
    async fn test_failures_open_circuit_and_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::CurrentConditions,
                CountingHandler {
                    calls: Arc::clone(&calls),
                    fail: true,
                },
            )
            .registry(strict_registry())
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let req = request("current_conditions", json!({ "station": "KSEA" }));

        for _ in 0..3 {
            let result = completed(dispatcher.execute(&req, &cancel).await);
            assert_eq!(result.error.as_ref().unwrap().kind, ToolErrorKind::Execution);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Fourth call fails fast without invoking the handler.
        let result = completed(dispatcher.execute(&req, &cancel).await);
        assert_eq!(result.error.as_ref().unwrap().kind, ToolErrorKind::CircuitOpen);
        assert!(result.error.as_ref().unwrap().message.contains("retry after"));
        assert_eq!(result.breaker_state, Some(BreakerState::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported_as_timeout_kind() {
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::RunForecast,
                handler_fn(|_args: Value| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(json!({}))
                    }) as BoxFuture<'static, anyhow::Result<Value>>
                }),
            )
            .profile(
                ToolId::RunForecast,
                ToolProfile {
                    call_timeout: Duration::from_millis(200),
                    retry: RetryOptions::none(),
                },
            )
            .build()
            .unwrap();

        let result = completed(
            dispatcher
                .execute(
                    &request(
                        "run_forecast",
                        json!({ "metric": "temperature_c", "horizon_hours": 6, "history": [1.0, 2.0] }),
                    ),
                    &CancellationToken::new(),
                )
                .await,
        );

        let fault = result.error.unwrap();
        assert_eq!(fault.kind, ToolErrorKind::Timeout);
        assert!(fault.message.contains("200ms"));
    }

    #[tokio::test]
    async fn test_retries_record_one_breaker_outcome() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::CurrentConditions,
                CountingHandler {
                    calls: Arc::clone(&calls),
                    fail: true,
                },
            )
            .profile(
                ToolId::CurrentConditions,
                ToolProfile {
                    call_timeout: Duration::from_secs(5),
                    retry: RetryOptions {
                        max_retries: 2,
                        backoff: crate::resilience::BackoffPolicy::new(
                            Duration::from_millis(1),
                            Duration::ZERO,
                        ),
                    },
                },
            )
            .registry(strict_registry())
            .build()
            .unwrap();

        let result = completed(
            dispatcher
                .execute(
                    &request("current_conditions", json!({ "station": "KSEA" })),
                    &CancellationToken::new(),
                )
                .await,
        );

        // Three attempts, one recorded failure: the breaker stays short of
        // its threshold of three.
        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = dispatcher.registry().breaker("current_conditions").snapshot();
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_handler_and_breaker() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::CurrentConditions,
                CountingHandler {
                    calls: Arc::clone(&calls),
                    fail: false,
                },
            )
            .cache(ToolCacheConfig {
                enabled: true,
                ..ToolCacheConfig::default()
            })
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let req = request("current_conditions", json!({ "station": "KSEA" }));

        let first = completed(dispatcher.execute(&req, &cancel).await);
        assert!(!first.cached);

        let second = completed(dispatcher.execute(&req, &cancel).await);
        assert!(second.cached);
        assert!(second.success);
        assert_eq!(second.breaker_state, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_is_interrupted_and_records_nothing() {
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::CurrentConditions,
                handler_fn(|_args: Value| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(json!({}))
                    }) as BoxFuture<'static, anyhow::Result<Value>>
                }),
            )
            .registry(strict_registry())
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = dispatcher
            .execute(
                &request("current_conditions", json!({ "station": "KSEA" })),
                &cancel,
            )
            .await;

        assert!(matches!(outcome, DispatchOutcome::Interrupted));
        let snapshot = dispatcher.registry().breaker("current_conditions").snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_specs_list_only_registered_tools() {
        let dispatcher = ToolDispatcher::builder()
            .handler(
                ToolId::AggregateMetrics,
                CountingHandler {
                    calls: Arc::new(AtomicU32::new(0)),
                    fail: false,
                },
            )
            .build()
            .unwrap();

        let specs = dispatcher.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "aggregate_metrics");
    }
}
