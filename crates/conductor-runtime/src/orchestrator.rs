//! Conversation orchestrator: the resilient multi-turn core loop.
//!
//! One run answers one user question. Each turn sends the conversation plus
//! the advertised tool set to the reasoner, classifies the reply, executes
//! any requested tool calls through the dispatcher, and feeds the results
//! back as conversation data. The loop is bounded by a [`RunBudget`] and
//! checkpointed through a [`ProgressSink`] after every turn.
//!
//! Failure policy: everything below the orchestrator (tool failures, open
//! circuits, invalid arguments) is folded into the conversation as data and
//! the run continues. Budget exhaustion and uninterpretable replies end the
//! run with a degraded but user-facing answer. Only the orchestrator's own
//! control plane (reasoner transport after client-side retries, checkpoint
//! storage) fails the run with an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conductor_core::{
    AnswerDefect, Conversation, ConversationTurn, FormatValidator, ProgressEvent,
    ProgressEventKind, ResponseValidator, RunBudget, RunId, RunProgress, Segment, ToolCallRequest,
};

use crate::checkpoint::{CheckpointError, ProgressSink};
use crate::reasoner::{Reasoner, ReasonerError, ReasonerReply, RequestedCall};
use crate::resilience::{retry_with, BreakerSummary, RetryOptions};
use crate::tools::{DispatchOutcome, ToolDispatcher};

/// Errors from the orchestrator's control plane.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Orchestrator not configured: {0}")]
    NotConfigured(String),

    #[error("Reasoner transport failed: {0}")]
    Reasoner(#[from] ReasonerError),

    #[error("Checkpoint store failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// How a run arrived at its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDisposition {
    /// Final answer passed validation.
    Answered,

    /// Final answer failed validation but turns were exhausted, so the
    /// defective answer was accepted rather than failing the run.
    AnsweredUnvalidated,

    /// The reasoner refused; its stated reason is the answer, verbatim.
    Blocked,

    /// The reply could not be interpreted; the answer explains the anomaly.
    MalformedReply,

    /// Turn allowance ran out before a final answer.
    TurnsExhausted,

    /// Wall clock ran out (or the run was cancelled) before a final answer.
    BudgetExhausted,
}

impl fmt::Display for RunDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunDisposition::Answered => "answered",
            RunDisposition::AnsweredUnvalidated => "answered_unvalidated",
            RunDisposition::Blocked => "blocked",
            RunDisposition::MalformedReply => "malformed_reply",
            RunDisposition::TurnsExhausted => "turns_exhausted",
            RunDisposition::BudgetExhausted => "budget_exhausted",
        };
        f.write_str(name)
    }
}

/// Result of one completed run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Identifier minted by the checkpoint store.
    pub run_id: RunId,

    /// User-facing answer (possibly a degraded terminal message).
    pub answer: String,

    /// How the answer was arrived at.
    pub disposition: RunDisposition,

    /// Reasoner invocations consumed.
    pub turns_used: u32,

    /// Tool calls dispatched.
    pub tool_calls: u32,

    /// The full conversation transcript.
    pub conversation: Conversation,
}

// Mutable per-run state threaded through the turn loop.
struct RunState {
    conversation: Conversation,
    turns_used: u32,
    tool_calls: u32,
    next_seq: u32,
}

// Why the turn loop stopped scheduling work.
enum LoopEnd {
    Terminal(RunDisposition, String),
    Fatal(OrchestratorError),
}

fn budget_exhausted_message() -> String {
    "I couldn't finish answering within the time budget for this request. \
     Partial progress was checkpointed; please retry, or narrow the question."
        .to_string()
}

fn max_turns_message(max_turns: u32) -> String {
    format!(
        "I reached the limit of {max_turns} reasoning turns before arriving at a final \
         answer. Please retry, or break the question into smaller parts."
    )
}

fn uninterpretable_message(detail: &str) -> String {
    format!(
        "The reasoning service returned a reply that could not be interpreted ({detail}), \
         so this request stopped early."
    )
}

fn correction_request(defect: &AnswerDefect) -> String {
    format!(
        "Your previous answer was rejected: {defect}. \
         Reply again with only the corrected final answer."
    )
}

/// Drives one conversation per [`run`](ConversationOrchestrator::run) call.
///
/// All collaborators are injected: the reasoner, the tool dispatcher (which
/// owns the breaker registry), the answer validator, and the checkpoint sink.
/// The orchestrator itself is stateless between runs and safe to share.
pub struct ConversationOrchestrator {
    reasoner: Arc<dyn Reasoner>,
    dispatcher: Arc<ToolDispatcher>,
    validator: Arc<dyn ResponseValidator>,
    sink: Arc<dyn ProgressSink>,
    budget: RunBudget,
    reasoner_retry: RetryOptions,
}

impl fmt::Debug for ConversationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationOrchestrator")
            .field("budget", &self.budget)
            .field("reasoner_retry", &self.reasoner_retry)
            .finish_non_exhaustive()
    }
}

impl ConversationOrchestrator {
    pub fn builder() -> ConversationOrchestratorBuilder {
        ConversationOrchestratorBuilder::new()
    }

    /// Breaker states across every tool, for dashboards.
    pub fn breaker_summary(&self) -> BreakerSummary {
        self.dispatcher.registry().summary()
    }

    /// Force one tool's breaker closed. Returns false if never materialized.
    pub fn reset_breaker(&self, name: &str) -> bool {
        self.dispatcher.registry().reset(name)
    }

    /// Force every breaker closed. Returns how many were reset.
    pub fn reset_all_breakers(&self) -> usize {
        self.dispatcher.registry().reset_all()
    }

    /// Answer one question, creating and finalizing a checkpointed run.
    ///
    /// Returns `Ok` with some answer, possibly degraded, for every outcome
    /// except control-plane failures, which finalize the run as failed and
    /// propagate. Exactly one of complete/fail is recorded per run.
    pub async fn run(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let started = Instant::now();
        let mut state = RunState {
            conversation: Conversation::opening(question),
            turns_used: 0,
            tool_calls: 0,
            next_seq: 1,
        };

        let initial = RunProgress {
            conversation_len: state.conversation.len(),
            turns_used: 0,
            tool_calls: 0,
        };
        let run_id = self.sink.create_run(initial.as_state_blob()).await?;
        info!(run_id = %run_id, "run started");

        let end = match self
            .sink
            .append_event(
                &run_id,
                ProgressEvent::now(ProgressEventKind::RunStarted, json!({ "question": question })),
            )
            .await
        {
            Ok(()) => self.drive(&run_id, &mut state, started, cancel).await,
            Err(e) => LoopEnd::Fatal(e.into()),
        };

        match end {
            LoopEnd::Terminal(disposition, answer) => {
                let sealed = self.seal_completed(&run_id, disposition, &answer).await;
                match sealed {
                    Ok(()) => {
                        info!(
                            run_id = %run_id,
                            disposition = %disposition,
                            turns = state.turns_used,
                            tool_calls = state.tool_calls,
                            "run completed"
                        );
                        Ok(RunOutcome {
                            run_id,
                            answer,
                            disposition,
                            turns_used: state.turns_used,
                            tool_calls: state.tool_calls,
                            conversation: state.conversation,
                        })
                    }
                    Err(error) => self.seal_failed(&run_id, error).await,
                }
            }
            LoopEnd::Fatal(error) => self.seal_failed(&run_id, error).await,
        }
    }

    async fn seal_completed(
        &self,
        run_id: &RunId,
        disposition: RunDisposition,
        answer: &str,
    ) -> Result<(), OrchestratorError> {
        self.sink
            .append_event(
                run_id,
                ProgressEvent::now(
                    ProgressEventKind::RunCompleted,
                    json!({ "disposition": disposition }),
                ),
            )
            .await?;
        self.sink.complete_run(run_id, answer).await?;
        Ok(())
    }

    // Best-effort failure record; always returns the original error.
    async fn seal_failed(
        &self,
        run_id: &RunId,
        error: OrchestratorError,
    ) -> Result<RunOutcome, OrchestratorError> {
        let message = error.to_string();
        warn!(run_id = %run_id, error = %message, "run failed");
        if let Err(sink_error) = self
            .sink
            .append_event(
                run_id,
                ProgressEvent::now(ProgressEventKind::RunFailed, json!({ "error": message })),
            )
            .await
        {
            warn!(run_id = %run_id, error = %sink_error, "could not record failure event");
        }
        if let Err(sink_error) = self.sink.fail_run(run_id, &message).await {
            warn!(run_id = %run_id, error = %sink_error, "could not finalize run as failed");
        }
        Err(error)
    }

    async fn save_progress(&self, run_id: &RunId, state: &RunState) -> Result<(), CheckpointError> {
        let progress = RunProgress {
            conversation_len: state.conversation.len(),
            turns_used: state.turns_used,
            tool_calls: state.tool_calls,
        };
        self.sink
            .save_checkpoint(run_id, progress.as_state_blob())
            .await
    }

    // One reasoner interaction, bounded by the effective turn timeout across
    // client-side retries. `None` means the run was cancelled mid-call.
    async fn call_reasoner(
        &self,
        conversation: &Conversation,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<Result<ReasonerReply, ReasonerError>> {
        let specs = self.dispatcher.specs();
        let attempt = retry_with(
            &self.reasoner_retry,
            ReasonerError::is_retryable,
            cancel,
            || self.reasoner.send(conversation, &specs, timeout),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = tokio::time::timeout(timeout, attempt) => Some(match outcome {
                Ok(result) => result,
                Err(_) => Err(ReasonerError::Timeout(timeout)),
            }),
        }
    }

    async fn drive(
        &self,
        run_id: &RunId,
        state: &mut RunState,
        started: Instant,
        cancel: &CancellationToken,
    ) -> LoopEnd {
        match self.drive_inner(run_id, state, started, cancel).await {
            Ok((disposition, answer)) => LoopEnd::Terminal(disposition, answer),
            Err(error) => LoopEnd::Fatal(error),
        }
    }

    async fn drive_inner(
        &self,
        run_id: &RunId,
        state: &mut RunState,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<(RunDisposition, String), OrchestratorError> {
        loop {
            let elapsed = started.elapsed();
            if cancel.is_cancelled() || self.budget.wall_clock_exceeded(elapsed) {
                return Ok((RunDisposition::BudgetExhausted, budget_exhausted_message()));
            }
            if self.budget.turns_exhausted(state.turns_used) {
                return Ok((
                    RunDisposition::TurnsExhausted,
                    max_turns_message(self.budget.max_turns),
                ));
            }
            let turn_timeout = self.budget.effective_turn_timeout(elapsed);
            if turn_timeout.is_zero() {
                return Ok((RunDisposition::BudgetExhausted, budget_exhausted_message()));
            }

            let turn = state.turns_used + 1;
            self.sink
                .append_event(
                    run_id,
                    ProgressEvent::now(ProgressEventKind::TurnStarted, json!({ "turn": turn })),
                )
                .await?;

            let reply = match self
                .call_reasoner(&state.conversation, turn_timeout, cancel)
                .await
            {
                None => {
                    return Ok((RunDisposition::BudgetExhausted, budget_exhausted_message()));
                }
                Some(Err(error)) => {
                    warn!(run_id = %run_id, error = %error, "reasoner transport failed");
                    return Err(error.into());
                }
                Some(Ok(reply)) => reply,
            };

            let classification = if reply.malformed.is_some() {
                "malformed"
            } else if reply.blocked.is_some() {
                "blocked"
            } else if !reply.tool_calls.is_empty() {
                "tool_calls"
            } else if reply.text.is_some() {
                "text"
            } else {
                "empty"
            };
            self.sink
                .append_event(
                    run_id,
                    ProgressEvent::now(
                        ProgressEventKind::ReasonerReplied,
                        json!({
                            "turn": turn,
                            "classification": classification,
                            "tool_calls": reply.tool_calls.len(),
                        }),
                    ),
                )
                .await?;

            // Classification, first match wins: malformed, blocked, tool
            // calls, text. An envelope with none of them falls through as
            // empty.
            let ReasonerReply {
                text,
                tool_calls,
                blocked,
                malformed,
            } = reply;

            if let Some(detail) = malformed {
                state.turns_used += 1;
                self.save_progress(run_id, state).await?;
                return Ok((
                    RunDisposition::MalformedReply,
                    uninterpretable_message(&detail),
                ));
            }

            if let Some(reason) = blocked {
                state.turns_used += 1;
                self.save_progress(run_id, state).await?;
                return Ok((RunDisposition::Blocked, reason));
            }

            if !tool_calls.is_empty() {
                let interrupted = self
                    .execute_tool_batch(run_id, state, text, tool_calls, cancel)
                    .await?;
                state.turns_used += 1;
                self.save_progress(run_id, state).await?;
                if interrupted {
                    return Ok((RunDisposition::BudgetExhausted, budget_exhausted_message()));
                }
                continue;
            }

            if let Some(text) = text {
                state
                    .conversation
                    .push(ConversationTurn::reasoner(vec![Segment::text(&text)]));
                state.turns_used += 1;

                match self.validator.check(&text) {
                    Ok(()) => {
                        self.save_progress(run_id, state).await?;
                        return Ok((RunDisposition::Answered, text));
                    }
                    Err(defect) => {
                        self.sink
                            .append_event(
                                run_id,
                                ProgressEvent::now(
                                    ProgressEventKind::ValidationRejected,
                                    json!({ "turn": turn, "defect": defect.to_string() }),
                                ),
                            )
                            .await?;
                        if self.budget.turns_exhausted(state.turns_used) {
                            // Out of turns: a defective answer beats none.
                            self.save_progress(run_id, state).await?;
                            return Ok((RunDisposition::AnsweredUnvalidated, text));
                        }
                        state
                            .conversation
                            .push(ConversationTurn::user_text(correction_request(&defect)));
                        self.save_progress(run_id, state).await?;
                        continue;
                    }
                }
            }

            state.turns_used += 1;
            self.save_progress(run_id, state).await?;
            return Ok((
                RunDisposition::MalformedReply,
                uninterpretable_message("reply envelope was empty"),
            ));
        }
    }

    // Executes one batch of requested calls sequentially, in request order.
    // Returns true when the run was cancelled partway through the batch.
    async fn execute_tool_batch(
        &self,
        run_id: &RunId,
        state: &mut RunState,
        narration: Option<String>,
        calls: Vec<RequestedCall>,
        cancel: &CancellationToken,
    ) -> Result<bool, OrchestratorError> {
        let mut segments = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = narration {
            segments.push(Segment::text(text));
        }
        let mut requests = Vec::with_capacity(calls.len());
        for call in calls {
            let request = ToolCallRequest {
                seq: state.next_seq,
                tool: call.name,
                arguments: call.arguments,
            };
            state.next_seq += 1;
            segments.push(Segment::ToolCall(request.clone()));
            requests.push(request);
        }
        state.conversation.push(ConversationTurn::reasoner(segments));

        let mut results = Vec::with_capacity(requests.len());
        let mut interrupted = false;
        for request in &requests {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            match self.dispatcher.execute(request, cancel).await {
                DispatchOutcome::Completed(result) => {
                    state.tool_calls += 1;
                    self.sink
                        .append_event(
                            run_id,
                            ProgressEvent::now(
                                ProgressEventKind::ToolCallCompleted,
                                json!({
                                    "seq": result.seq,
                                    "tool": result.tool,
                                    "success": result.success,
                                    "error_kind": result.error.as_ref().map(|f| f.kind),
                                }),
                            ),
                        )
                        .await?;
                    results.push(result);
                }
                DispatchOutcome::Interrupted => {
                    interrupted = true;
                    break;
                }
            }
        }
        if !results.is_empty() {
            state
                .conversation
                .push(ConversationTurn::tool_results(results));
        }
        Ok(interrupted)
    }
}

/// Builder for [`ConversationOrchestrator`].
pub struct ConversationOrchestratorBuilder {
    reasoner: Option<Arc<dyn Reasoner>>,
    dispatcher: Option<Arc<ToolDispatcher>>,
    validator: Arc<dyn ResponseValidator>,
    sink: Option<Arc<dyn ProgressSink>>,
    budget: RunBudget,
    reasoner_retry: RetryOptions,
}

impl ConversationOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            reasoner: None,
            dispatcher: None,
            validator: Arc::new(FormatValidator::default()),
            sink: None,
            budget: RunBudget::default(),
            reasoner_retry: RetryOptions::default(),
        }
    }

    /// Set the reasoner backend (required).
    pub fn reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// Set the tool dispatcher (required).
    pub fn dispatcher(mut self, dispatcher: Arc<ToolDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Replace the default format validator.
    pub fn validator(mut self, validator: Arc<dyn ResponseValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Set the checkpoint sink (required).
    pub fn sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the run budget.
    pub fn budget(mut self, budget: RunBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Retry policy for reasoner transport failures.
    pub fn reasoner_retry(mut self, retry: RetryOptions) -> Self {
        self.reasoner_retry = retry;
        self
    }

    pub fn build(self) -> Result<ConversationOrchestrator, OrchestratorError> {
        let reasoner = self
            .reasoner
            .ok_or_else(|| OrchestratorError::NotConfigured("No reasoner set".to_string()))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| OrchestratorError::NotConfigured("No dispatcher set".to_string()))?;
        let sink = self
            .sink
            .ok_or_else(|| OrchestratorError::NotConfigured("No checkpoint sink set".to_string()))?;

        Ok(ConversationOrchestrator {
            reasoner,
            dispatcher,
            validator: self.validator,
            sink,
            budget: self.budget,
            reasoner_retry: self.reasoner_retry,
        })
    }
}

impl Default for ConversationOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
