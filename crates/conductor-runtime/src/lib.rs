//! # conductor-runtime
//!
//! Async orchestration runtime for Conductor: answers one user question per
//! run by alternating reasoner calls with tool execution until a validated
//! final answer emerges or the run budget is spent.
//!
//! Built on the data model in `conductor-core`, this crate adds:
//! - the turn loop ([`ConversationOrchestrator`]) with budget enforcement,
//!   answer validation, and per-turn checkpointing,
//! - the tool dispatch pipeline ([`ToolDispatcher`]): schema validation,
//!   timeouts, retries, per-tool circuit breakers, optional result caching,
//! - reasoner backends behind the [`Reasoner`] trait (the Anthropic Messages
//!   API under the `anthropic` feature, plus a scripted backend for tests),
//! - resilience primitives: exponential backoff, bounded retry, circuit
//!   breakers and their registry,
//! - YAML configuration covering all of the above.
//!
//! ## Failure policy
//!
//! Tool-level failures (unknown tool, invalid arguments, open circuit,
//! timeout, handler error) become `ToolCallResult` records the reasoner sees
//! as conversation data. Only control-plane failures end a run with an
//! error: reasoner transport after client-side retries, and checkpoint
//! storage. Everything else produces an answer, possibly degraded.
//!
//! ## Example
//!
//! ```rust,ignore
//! use conductor_runtime::{
//!     AnthropicReasoner, ConversationOrchestrator, InMemoryCheckpoints, ToolDispatcher, ToolId,
//! };
//!
//! let dispatcher = ToolDispatcher::builder()
//!     .handler(ToolId::CurrentConditions, station_handler)
//!     .build()?;
//!
//! let orchestrator = ConversationOrchestrator::builder()
//!     .reasoner(Arc::new(AnthropicReasoner::from_env()?))
//!     .dispatcher(Arc::new(dispatcher))
//!     .sink(Arc::new(InMemoryCheckpoints::new()))
//!     .build()?;
//!
//! let outcome = orchestrator.run("How windy was it overnight?", &cancel).await?;
//! println!("{}", outcome.answer);
//! ```

pub mod checkpoint;
pub mod config;
pub mod orchestrator;
pub mod reasoner;
pub mod resilience;
pub mod tools;

// Re-export main types at crate root
pub use checkpoint::{CheckpointError, InMemoryCheckpoints, ProgressSink};
pub use config::{ConfigError, ReasonerConfig, RuntimeConfig, ToolSettings, ToolsConfig};
pub use orchestrator::{
    ConversationOrchestrator, ConversationOrchestratorBuilder, OrchestratorError, RunDisposition,
    RunOutcome,
};
#[cfg(feature = "anthropic")]
pub use reasoner::AnthropicReasoner;
pub use reasoner::{
    ApiCredential, Reasoner, ReasonerError, ReasonerReply, ReasonerSettings, RequestedCall,
    ScriptedReasoner,
};
pub use resilience::{
    retry_with, BackoffPolicy, BreakerProfiles, BreakerSnapshot, BreakerSummary, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerRegistry, OpenRejection, RetryOptions,
};
pub use tools::{
    handler_fn, DispatchOutcome, ToolCacheConfig, ToolDispatcher, ToolDispatcherBuilder,
    ToolHandler, ToolId, ToolProfile, ToolResultCache, ToolSetupError,
};
