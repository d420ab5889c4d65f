//! Conversation data model for tool-calling orchestration runs.
//!
//! A run is a growing list of turns: the opening user question, reasoner
//! replies (text and/or tool-call requests), and tool-result turns answering
//! those requests. Requests and results are paired by orchestration-assigned
//! sequence numbers; [`Conversation::audit_pairing`] checks that no call is
//! left orphaned.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::duration_ms;

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    User,
    Reasoner,
    ToolResult,
}

/// Circuit breaker state observed at tool-call time.
///
/// Recorded on every [`ToolCallResult`] so conversation logs show which calls
/// ran against a degraded dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Normalized tool failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorKind {
    /// The requested name is outside the registered tool set.
    UnknownTool,
    /// The tool's breaker rejected the call without invoking the handler.
    CircuitOpen,
    /// The argument map failed the tool's parameter schema.
    InvalidArgs,
    /// The handler did not finish within its call timeout.
    Timeout,
    /// The handler ran and returned an error.
    Execution,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolErrorKind::UnknownTool => write!(f, "UNKNOWN_TOOL"),
            ToolErrorKind::CircuitOpen => write!(f, "CIRCUIT_OPEN"),
            ToolErrorKind::InvalidArgs => write!(f, "INVALID_ARGS"),
            ToolErrorKind::Timeout => write!(f, "TIMEOUT"),
            ToolErrorKind::Execution => write!(f, "EXECUTION"),
        }
    }
}

/// Normalized error descriptor carried by failed tool results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFault {
    /// Failure category.
    pub kind: ToolErrorKind,

    /// Human-readable detail, safe to show to the reasoner.
    pub message: String,
}

impl ToolFault {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ToolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A tool invocation requested by the reasoner.
///
/// Sequence numbers are assigned by the orchestrator in request order and are
/// unique within a run. Requests are immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Run-unique sequence number, 1-based, in request order.
    pub seq: u32,

    /// Requested tool name, as the reasoner spelled it.
    pub tool: String,

    /// Free-form argument map.
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(seq: u32, tool: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            seq,
            tool: tool.into(),
            arguments,
        }
    }
}

/// Outcome of one dispatched tool call.
///
/// Created by the dispatcher immediately after the invocation returns or is
/// rejected; never mutated afterward. The orchestrator appends it to the
/// conversation so the reasoner can see failures as data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallResult {
    /// Sequence number of the request this result answers.
    pub seq: u32,

    /// Tool name the result belongs to.
    pub tool: String,

    /// Whether the call produced a payload.
    pub success: bool,

    /// Successful payload, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Normalized failure descriptor, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFault>,

    /// Wall-clock duration of the invocation (zero for rejected calls).
    #[serde(with = "duration_ms")]
    pub duration: Duration,

    /// Breaker state observed at call time; `None` when no breaker was
    /// consulted (unknown tool).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_state: Option<BreakerState>,

    /// True when the payload was served from the tool-result cache.
    #[serde(default)]
    pub cached: bool,
}

impl ToolCallResult {
    /// Build a successful result.
    pub fn success(
        request: &ToolCallRequest,
        payload: serde_json::Value,
        duration: Duration,
        breaker_state: Option<BreakerState>,
    ) -> Self {
        Self {
            seq: request.seq,
            tool: request.tool.clone(),
            success: true,
            payload: Some(payload),
            error: None,
            duration,
            breaker_state,
            cached: false,
        }
    }

    /// Build a failed result carrying a normalized fault.
    pub fn failure(
        request: &ToolCallRequest,
        fault: ToolFault,
        duration: Duration,
        breaker_state: Option<BreakerState>,
    ) -> Self {
        Self {
            seq: request.seq,
            tool: request.tool.clone(),
            success: false,
            payload: None,
            error: Some(fault),
            duration,
            breaker_state,
            cached: false,
        }
    }
}

/// Reasoner-facing description of one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    /// Name the reasoner must use to request the tool.
    pub name: String,

    /// What the tool does, phrased for the reasoner.
    pub description: String,

    /// JSON Schema for the argument map.
    pub parameters: serde_json::Value,
}

/// One content segment within a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    ToolCall(ToolCallRequest),
    ToolResult(ToolCallResult),
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text { text: text.into() }
    }
}

/// One turn in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    /// Producer of this turn.
    pub role: Role,

    /// Ordered content segments.
    pub segments: Vec<Segment>,
}

impl ConversationTurn {
    /// A user turn holding a single text segment.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            segments: vec![Segment::text(text)],
        }
    }

    /// A reasoner turn with arbitrary segments (text and/or tool calls).
    pub fn reasoner(segments: Vec<Segment>) -> Self {
        Self {
            role: Role::Reasoner,
            segments,
        }
    }

    /// A tool-result turn answering one batch of requests.
    pub fn tool_results(results: Vec<ToolCallResult>) -> Self {
        Self {
            role: Role::ToolResult,
            segments: results.into_iter().map(Segment::ToolResult).collect(),
        }
    }

    /// Tool-call requests contained in this turn, in segment order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRequest> {
        self.segments.iter().filter_map(|s| match s {
            Segment::ToolCall(req) => Some(req),
            _ => None,
        })
    }

    /// Tool results contained in this turn, in segment order.
    pub fn tool_results_iter(&self) -> impl Iterator<Item = &ToolCallResult> {
        self.segments.iter().filter_map(|s| match s {
            Segment::ToolResult(res) => Some(res),
            _ => None,
        })
    }

    /// Concatenated text segments of this turn.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            if let Segment::Text { text } = segment {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// Violations found by [`Conversation::audit_pairing`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("tool call #{seq} was never answered")]
    UnansweredCall { seq: u32 },

    #[error("tool result #{seq} answers no pending call")]
    StrayResult { seq: u32 },

    #[error("tool results out of request order: got #{got}, expected #{expected}")]
    OutOfOrder { got: u32, expected: u32 },
}

/// The growing conversation for one orchestration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    /// Start a conversation with the opening user question.
    pub fn opening(question: impl Into<String>) -> Self {
        Self {
            turns: vec![ConversationTurn::user_text(question)],
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Sequence numbers of tool-call requests not yet answered by a result.
    ///
    /// A run abandoned by cancellation may legitimately leave trailing
    /// unanswered calls; completed runs must not.
    pub fn unanswered_requests(&self) -> Vec<u32> {
        let mut pending: Vec<u32> = Vec::new();
        for turn in &self.turns {
            for req in turn.tool_calls() {
                pending.push(req.seq);
            }
            for res in turn.tool_results_iter() {
                pending.retain(|&seq| seq != res.seq);
            }
        }
        pending
    }

    /// Check the request/result pairing discipline over the whole log.
    ///
    /// Every tool-call request must be answered by exactly one result, in
    /// request order, before the next reasoner turn and, for a completed
    /// run, before the log ends.
    pub fn audit_pairing(&self) -> Result<(), PairingError> {
        let mut pending: Vec<u32> = Vec::new();
        for turn in &self.turns {
            if turn.role == Role::Reasoner {
                if let Some(&seq) = pending.first() {
                    return Err(PairingError::UnansweredCall { seq });
                }
            }
            for req in turn.tool_calls() {
                pending.push(req.seq);
            }
            for res in turn.tool_results_iter() {
                match pending.first() {
                    Some(&expected) if expected == res.seq => {
                        pending.remove(0);
                    }
                    Some(&expected) if pending.contains(&res.seq) => {
                        return Err(PairingError::OutOfOrder {
                            got: res.seq,
                            expected,
                        });
                    }
                    _ => return Err(PairingError::StrayResult { seq: res.seq }),
                }
            }
        }
        if let Some(&seq) = pending.first() {
            return Err(PairingError::UnansweredCall { seq });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(seq: u32) -> ToolCallRequest {
        ToolCallRequest::new(seq, "aggregate_metrics", json!({ "metric": "temp" }))
    }

    fn ok_result(seq: u32) -> ToolCallResult {
        ToolCallResult::success(
            &request(seq),
            json!({ "value": 21.5 }),
            Duration::from_millis(12),
            Some(BreakerState::Closed),
        )
    }

    #[test]
    fn test_opening_conversation_has_user_turn() {
        let conversation = Conversation::opening("How hot was it yesterday?");
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.turns()[0].role, Role::User);
        assert_eq!(
            conversation.turns()[0].joined_text(),
            "How hot was it yesterday?"
        );
    }

    #[test]
    fn test_paired_requests_pass_audit() {
        let mut conversation = Conversation::opening("q");
        conversation.push(ConversationTurn::reasoner(vec![
            Segment::text("checking"),
            Segment::ToolCall(request(1)),
            Segment::ToolCall(request(2)),
        ]));
        conversation.push(ConversationTurn::tool_results(vec![
            ok_result(1),
            ok_result(2),
        ]));
        conversation.push(ConversationTurn::reasoner(vec![Segment::text("done")]));

        assert_eq!(conversation.audit_pairing(), Ok(()));
        assert!(conversation.unanswered_requests().is_empty());
    }

    #[test]
    fn test_unanswered_call_before_next_reasoner_turn_fails_audit() {
        let mut conversation = Conversation::opening("q");
        conversation.push(ConversationTurn::reasoner(vec![Segment::ToolCall(
            request(1),
        )]));
        conversation.push(ConversationTurn::reasoner(vec![Segment::text("done")]));

        assert_eq!(
            conversation.audit_pairing(),
            Err(PairingError::UnansweredCall { seq: 1 })
        );
    }

    #[test]
    fn test_trailing_unanswered_call_fails_audit() {
        let mut conversation = Conversation::opening("q");
        conversation.push(ConversationTurn::reasoner(vec![Segment::ToolCall(
            request(7),
        )]));

        assert_eq!(
            conversation.audit_pairing(),
            Err(PairingError::UnansweredCall { seq: 7 })
        );
        assert_eq!(conversation.unanswered_requests(), vec![7]);
    }

    #[test]
    fn test_out_of_order_results_fail_audit() {
        let mut conversation = Conversation::opening("q");
        conversation.push(ConversationTurn::reasoner(vec![
            Segment::ToolCall(request(1)),
            Segment::ToolCall(request(2)),
        ]));
        conversation.push(ConversationTurn::tool_results(vec![
            ok_result(2),
            ok_result(1),
        ]));

        assert_eq!(
            conversation.audit_pairing(),
            Err(PairingError::OutOfOrder {
                got: 2,
                expected: 1
            })
        );
    }

    #[test]
    fn test_stray_result_fails_audit() {
        let mut conversation = Conversation::opening("q");
        conversation.push(ConversationTurn::tool_results(vec![ok_result(9)]));

        assert_eq!(
            conversation.audit_pairing(),
            Err(PairingError::StrayResult { seq: 9 })
        );
    }

    #[test]
    fn test_failed_result_carries_normalized_fault() {
        let req = request(3);
        let result = ToolCallResult::failure(
            &req,
            ToolFault::new(ToolErrorKind::Timeout, "no reply within 5s"),
            Duration::from_secs(5),
            Some(BreakerState::HalfOpen),
        );

        assert!(!result.success);
        assert!(result.payload.is_none());
        let fault = result.error.as_ref().unwrap();
        assert_eq!(fault.kind, ToolErrorKind::Timeout);
        assert_eq!(fault.to_string(), "TIMEOUT: no reply within 5s");
    }

    #[test]
    fn test_segment_serialization_tags() {
        let text = serde_json::to_value(Segment::text("hello")).unwrap();
        assert_eq!(text["type"], "text");

        let call = serde_json::to_value(Segment::ToolCall(request(1))).unwrap();
        assert_eq!(call["type"], "tool_call");
        assert_eq!(call["seq"], 1);

        let result = serde_json::to_value(Segment::ToolResult(ok_result(1))).unwrap();
        assert_eq!(result["type"], "tool_result");
        assert_eq!(result["duration"], 12);
    }

    #[test]
    fn test_error_kind_wire_names() {
        let kind = serde_json::to_value(ToolErrorKind::UnknownTool).unwrap();
        assert_eq!(kind, "UNKNOWN_TOOL");
        let kind = serde_json::to_value(ToolErrorKind::CircuitOpen).unwrap();
        assert_eq!(kind, "CIRCUIT_OPEN");
    }

    #[test]
    fn test_conversation_round_trips_through_json() {
        let mut conversation = Conversation::opening("q");
        conversation.push(ConversationTurn::reasoner(vec![
            Segment::text("looking"),
            Segment::ToolCall(request(1)),
        ]));
        conversation.push(ConversationTurn::tool_results(vec![ok_result(1)]));

        let encoded = serde_json::to_string(&conversation).unwrap();
        let decoded: Conversation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, conversation);
    }
}
