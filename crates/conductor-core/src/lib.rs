//! # conductor-core
//!
//! Data model and deterministic pieces of the Conductor orchestration core.
//!
//! This crate defines the vocabulary the async runtime operates on:
//! - conversations made of user / reasoner / tool-result turns,
//! - tool-call requests and normalized results paired by sequence number,
//! - run budgets (turns, per-turn timeout, wall clock),
//! - checkpoint records for resumable runs,
//! - format validation for candidate final answers.
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: No I/O, no clocks beyond timestamping constructors
//! 2. **Failure as data**: Tool failures are [`ToolCallResult`] records, never
//!    control flow
//! 3. **Auditable**: [`Conversation::audit_pairing`] proves no tool call is
//!    left orphaned
//!
//! ## Example
//!
//! ```rust,ignore
//! use conductor_core::{Conversation, ConversationTurn, Segment, ToolCallRequest};
//!
//! let mut conversation = Conversation::opening("How hot was it yesterday?");
//! conversation.push(ConversationTurn::reasoner(vec![
//!     Segment::ToolCall(ToolCallRequest::new(1, "aggregate_metrics", args)),
//! ]));
//! assert_eq!(conversation.unanswered_requests(), vec![1]);
//! ```

pub mod budget;
pub mod checkpoint;
pub mod conversation;
pub mod validator;

// Re-export main types at crate root
pub use budget::RunBudget;
pub use checkpoint::{
    Checkpoint, ProgressEvent, ProgressEventKind, RunId, RunProgress, RunStatus,
};
pub use conversation::{
    BreakerState, Conversation, ConversationTurn, PairingError, Role, Segment, ToolCallRequest,
    ToolCallResult, ToolErrorKind, ToolFault, ToolSpec,
};
pub use validator::{AnswerDefect, FormatValidator, ResponseValidator};
