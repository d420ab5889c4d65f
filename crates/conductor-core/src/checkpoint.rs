//! Checkpoint records for resumable orchestration runs.
//!
//! A checkpoint is the durable trace of one run: an orchestration-defined
//! state blob updated after every turn, a free-form progress-event log, and a
//! status that is finalized exactly once (completed XOR failed). Breaker
//! state is deliberately absent: a fresh process starts every breaker
//! CLOSED.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque run identifier minted by the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a checkpointed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    /// Completed and failed runs accept no further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Progress-event categories emitted over a run's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    RunStarted,
    TurnStarted,
    ReasonerReplied,
    ToolCallCompleted,
    ValidationRejected,
    RunCompleted,
    RunFailed,
}

/// One entry in a run's progress log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    /// When the event was recorded.
    pub at: DateTime<Utc>,

    /// Event category.
    pub kind: ProgressEventKind,

    /// Free-form detail payload.
    pub detail: serde_json::Value,
}

impl ProgressEvent {
    /// Record an event timestamped now.
    pub fn now(kind: ProgressEventKind, detail: serde_json::Value) -> Self {
        Self {
            at: Utc::now(),
            kind,
            detail,
        }
    }
}

/// Orchestration-defined progress snapshot saved after every turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunProgress {
    /// Number of turns in the conversation so far.
    pub conversation_len: usize,

    /// Turns consumed against the budget.
    pub turns_used: u32,

    /// Tool calls dispatched so far.
    pub tool_calls: u32,
}

impl RunProgress {
    /// Encode as the free-form checkpoint state blob.
    pub fn as_state_blob(&self) -> serde_json::Value {
        serde_json::json!({
            "conversation_len": self.conversation_len,
            "turns_used": self.turns_used,
            "tool_calls": self.tool_calls,
        })
    }

    /// Decode from a checkpoint state blob, if it holds one.
    pub fn from_state_blob(blob: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(blob.clone()).ok()
    }
}

/// Durable record of one run's progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Identifier assigned at creation.
    pub run_id: RunId,

    /// Current lifecycle status.
    pub status: RunStatus,

    /// Orchestration-defined state blob (see [`RunProgress`]).
    pub state: serde_json::Value,

    /// Append-only progress log.
    pub events: Vec<ProgressEvent>,

    /// Final answer, present once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,

    /// Failure message, present once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the most recent update.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh pending checkpoint for a newly created run.
    pub fn new(run_id: RunId, initial_state: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            status: RunStatus::Pending,
            state: initial_state,
            events: Vec::new(),
            final_answer: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_wire_names_are_lowercase() {
        assert_eq!(
            serde_json::to_value(RunStatus::Processing).unwrap(),
            "processing"
        );
        assert_eq!(serde_json::to_value(RunStatus::Failed).unwrap(), "failed");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_checkpoint_is_pending_and_empty() {
        let checkpoint = Checkpoint::new(RunId::new("run-1"), json!({}));
        assert_eq!(checkpoint.status, RunStatus::Pending);
        assert!(checkpoint.events.is_empty());
        assert!(checkpoint.final_answer.is_none());
        assert!(checkpoint.error.is_none());
        assert_eq!(checkpoint.created_at, checkpoint.updated_at);
    }

    #[test]
    fn test_run_progress_blob_round_trip() {
        let progress = RunProgress {
            conversation_len: 5,
            turns_used: 2,
            tool_calls: 3,
        };
        let blob = progress.as_state_blob();
        assert_eq!(blob["turns_used"], 2);
        assert_eq!(RunProgress::from_state_blob(&blob), Some(progress));
        assert_eq!(RunProgress::from_state_blob(&json!("nonsense")), None);
    }

    #[test]
    fn test_progress_event_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(ProgressEventKind::ToolCallCompleted).unwrap(),
            "tool_call_completed"
        );
    }
}
