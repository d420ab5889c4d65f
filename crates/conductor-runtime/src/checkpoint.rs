//! Checkpoint persistence behind the orchestrator.
//!
//! [`ProgressSink`] is the seam between the turn loop and storage: the
//! orchestrator writes run lifecycle updates through it and never sees where
//! they land. [`InMemoryCheckpoints`] is the store used by tests and the CLI;
//! a database-backed sink implements the same trait.
//!
//! Finalization is enforced here, not just promised by the orchestrator: a
//! completed or failed run rejects every further write.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use conductor_core::{Checkpoint, ProgressEvent, RunId, RunStatus};

/// Errors from checkpoint stores.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("Run {run_id} already finalized as {status:?}")]
    AlreadyFinalized { run_id: String, status: RunStatus },

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Sink for run lifecycle updates.
///
/// Contract: `create_run` mints the id; `save_checkpoint` and `append_event`
/// may be called any number of times while the run is live; exactly one of
/// `complete_run` or `fail_run` ends it, after which every call fails with
/// [`CheckpointError::AlreadyFinalized`].
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Create a run record and mint its id.
    async fn create_run(&self, initial_state: Value) -> Result<RunId, CheckpointError>;

    /// Replace the run's state blob.
    async fn save_checkpoint(&self, run_id: &RunId, state: Value) -> Result<(), CheckpointError>;

    /// Append one progress event.
    async fn append_event(
        &self,
        run_id: &RunId,
        event: ProgressEvent,
    ) -> Result<(), CheckpointError>;

    /// Finalize the run as completed, recording the answer.
    async fn complete_run(&self, run_id: &RunId, final_answer: &str)
        -> Result<(), CheckpointError>;

    /// Finalize the run as failed, recording the failure message.
    async fn fail_run(&self, run_id: &RunId, message: &str) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store.
pub struct InMemoryCheckpoints {
    runs: RwLock<BTreeMap<String, Checkpoint>>,
    counter: AtomicU64,
}

impl InMemoryCheckpoints {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(BTreeMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Current checkpoint for a run, if it exists.
    pub fn checkpoint(&self, run_id: &RunId) -> Option<Checkpoint> {
        self.runs.read().get(run_id.as_str()).cloned()
    }

    /// Every stored checkpoint.
    pub fn list(&self) -> Vec<Checkpoint> {
        self.runs.read().values().cloned().collect()
    }

    fn update<F>(&self, run_id: &RunId, apply: F) -> Result<(), CheckpointError>
    where
        F: FnOnce(&mut Checkpoint),
    {
        let mut runs = self.runs.write();
        let checkpoint = runs
            .get_mut(run_id.as_str())
            .ok_or_else(|| CheckpointError::UnknownRun(run_id.to_string()))?;
        if checkpoint.status.is_terminal() {
            return Err(CheckpointError::AlreadyFinalized {
                run_id: run_id.to_string(),
                status: checkpoint.status,
            });
        }
        apply(checkpoint);
        checkpoint.updated_at = chrono::Utc::now();
        Ok(())
    }
}

impl Default for InMemoryCheckpoints {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressSink for InMemoryCheckpoints {
    async fn create_run(&self, initial_state: Value) -> Result<RunId, CheckpointError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let run_id = RunId::new(format!("run-{n}"));
        let checkpoint = Checkpoint::new(run_id.clone(), initial_state);
        self.runs
            .write()
            .insert(run_id.as_str().to_string(), checkpoint);
        debug!(run_id = %run_id, "run created");
        Ok(run_id)
    }

    async fn save_checkpoint(&self, run_id: &RunId, state: Value) -> Result<(), CheckpointError> {
        self.update(run_id, |checkpoint| {
            checkpoint.state = state;
            // First save moves the run out of pending.
            if checkpoint.status == RunStatus::Pending {
                checkpoint.status = RunStatus::Processing;
            }
        })
    }

    async fn append_event(
        &self,
        run_id: &RunId,
        event: ProgressEvent,
    ) -> Result<(), CheckpointError> {
        self.update(run_id, |checkpoint| checkpoint.events.push(event))
    }

    async fn complete_run(
        &self,
        run_id: &RunId,
        final_answer: &str,
    ) -> Result<(), CheckpointError> {
        self.update(run_id, |checkpoint| {
            checkpoint.status = RunStatus::Completed;
            checkpoint.final_answer = Some(final_answer.to_string());
        })
    }

    async fn fail_run(&self, run_id: &RunId, message: &str) -> Result<(), CheckpointError> {
        self.update(run_id, |checkpoint| {
            checkpoint.status = RunStatus::Failed;
            checkpoint.error = Some(message.to_string());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::ProgressEventKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_mints_sequential_ids() {
        let sink = InMemoryCheckpoints::new();
        let first = sink.create_run(json!({})).await.unwrap();
        let second = sink.create_run(json!({})).await.unwrap();
        assert_eq!(first.as_str(), "run-1");
        assert_eq!(second.as_str(), "run-2");
        assert_eq!(sink.list().len(), 2);
    }

    #[tokio::test]
    async fn test_first_save_moves_run_to_processing() {
        let sink = InMemoryCheckpoints::new();
        let run_id = sink.create_run(json!({})).await.unwrap();
        assert_eq!(sink.checkpoint(&run_id).unwrap().status, RunStatus::Pending);

        sink.save_checkpoint(&run_id, json!({ "turns_used": 1 }))
            .await
            .unwrap();
        let checkpoint = sink.checkpoint(&run_id).unwrap();
        assert_eq!(checkpoint.status, RunStatus::Processing);
        assert_eq!(checkpoint.state["turns_used"], 1);
    }

    #[tokio::test]
    async fn test_events_append_in_order() {
        let sink = InMemoryCheckpoints::new();
        let run_id = sink.create_run(json!({})).await.unwrap();

        sink.append_event(
            &run_id,
            ProgressEvent::now(ProgressEventKind::RunStarted, json!({})),
        )
        .await
        .unwrap();
        sink.append_event(
            &run_id,
            ProgressEvent::now(ProgressEventKind::TurnStarted, json!({ "turn": 1 })),
        )
        .await
        .unwrap();

        let events = sink.checkpoint(&run_id).unwrap().events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ProgressEventKind::RunStarted);
        assert_eq!(events[1].kind, ProgressEventKind::TurnStarted);
    }

    #[tokio::test]
    async fn test_complete_records_answer_and_seals_the_run() {
        let sink = InMemoryCheckpoints::new();
        let run_id = sink.create_run(json!({})).await.unwrap();

        sink.complete_run(&run_id, "18C and overcast").await.unwrap();
        let checkpoint = sink.checkpoint(&run_id).unwrap();
        assert_eq!(checkpoint.status, RunStatus::Completed);
        assert_eq!(checkpoint.final_answer.as_deref(), Some("18C and overcast"));

        // No further writes of any kind.
        let err = sink.fail_run(&run_id, "too late").await.unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyFinalized { .. }));
        assert!(sink.save_checkpoint(&run_id, json!({})).await.is_err());
        assert!(sink
            .append_event(
                &run_id,
                ProgressEvent::now(ProgressEventKind::RunFailed, json!({}))
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fail_records_message_and_seals_the_run() {
        let sink = InMemoryCheckpoints::new();
        let run_id = sink.create_run(json!({})).await.unwrap();

        sink.fail_run(&run_id, "reasoner unreachable").await.unwrap();
        let checkpoint = sink.checkpoint(&run_id).unwrap();
        assert_eq!(checkpoint.status, RunStatus::Failed);
        assert_eq!(checkpoint.error.as_deref(), Some("reasoner unreachable"));
        assert!(checkpoint.final_answer.is_none());

        assert!(sink.complete_run(&run_id, "answer").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_run_is_rejected() {
        let sink = InMemoryCheckpoints::new();
        let bogus = RunId::new("run-999");
        let err = sink.save_checkpoint(&bogus, json!({})).await.unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownRun(_)));
    }
}
