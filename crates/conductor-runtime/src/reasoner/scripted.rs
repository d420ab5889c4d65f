//! Scripted reasoner for offline runs and tests.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;

use conductor_core::{Conversation, ToolSpec};

use super::{Reasoner, ReasonerError, ReasonerReply};

/// Replays a fixed sequence of replies, one per `send`.
///
/// Useful for demos without network access and for exercising the turn loop
/// deterministically. Running past the end of the script is treated as a
/// configuration error rather than a reply, so a script that is too short
/// fails the run loudly instead of burning correction turns.
pub struct ScriptedReasoner {
    replies: Mutex<VecDeque<ReasonerReply>>,
    total: usize,
}

impl ScriptedReasoner {
    pub fn new(replies: Vec<ReasonerReply>) -> Self {
        Self {
            total: replies.len(),
            replies: Mutex::new(replies.into()),
        }
    }

    /// Load a script from a YAML file containing a list of reply envelopes.
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        let replies: Vec<ReasonerReply> = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse script {}", path.display()))?;
        Ok(Self::new(replies))
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn send(
        &self,
        _conversation: &Conversation,
        _tools: &[ToolSpec],
        _timeout: Duration,
    ) -> Result<ReasonerReply, ReasonerError> {
        self.replies.lock().pop_front().ok_or_else(|| {
            ReasonerError::NotConfigured(format!(
                "script exhausted after {} replies",
                self.total
            ))
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::RequestedCall;
    use serde_json::json;

    fn send_args() -> (Conversation, Vec<ToolSpec>, Duration) {
        (
            Conversation::opening("what's the weather in Seattle?"),
            Vec::new(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_replays_replies_in_order() {
        let reasoner = ScriptedReasoner::new(vec![
            ReasonerReply::calls(vec![RequestedCall::new(
                "current_conditions",
                json!({ "station": "KSEA" }),
            )]),
            ReasonerReply::answer("Currently 18C and overcast in Seattle."),
        ]);
        let (conversation, tools, timeout) = send_args();

        let first = reasoner.send(&conversation, &tools, timeout).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(reasoner.remaining(), 1);

        let second = reasoner.send(&conversation, &tools, timeout).await.unwrap();
        assert!(second.text.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_script_is_a_transport_error() {
        let reasoner = ScriptedReasoner::new(vec![]);
        let (conversation, tools, timeout) = send_args();

        let err = reasoner.send(&conversation, &tools, timeout).await.unwrap_err();
        assert!(matches!(err, ReasonerError::NotConfigured(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_script_parses_from_yaml() {
        let yaml = r#"
- tool_calls:
    - name: current_conditions
      arguments:
        station: KSEA
- text: "Currently 18C and overcast."
"#;
        let replies: Vec<ReasonerReply> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].tool_calls[0].name, "current_conditions");
        assert_eq!(replies[1].text.as_deref(), Some("Currently 18C and overcast."));
    }
}
