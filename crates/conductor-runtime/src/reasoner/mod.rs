//! Reasoner abstractions for conductor-runtime.
//!
//! This module defines the trait for the reasoning model behind a run and the
//! normalized reply envelope every backend is folded into. The orchestrator
//! only ever sees [`ReasonerReply`]: a backend's wire quirks (content blocks,
//! stop reasons, refusal shapes) are resolved here, so classification in the
//! turn loop stays a plain match on one struct.
//!
//! ## Security
//!
//! Backends that talk to hosted APIs use [`ApiCredential`] for credential
//! handling; key material never reaches Debug output or error messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use conductor_core::{Conversation, ToolSpec};

mod credentials;
mod scripted;

#[cfg(feature = "anthropic")]
mod anthropic;

pub use credentials::ApiCredential;
pub use scripted::ScriptedReasoner;

#[cfg(feature = "anthropic")]
pub use anthropic::AnthropicReasoner;

/// Errors from reasoner backends.
///
/// These are transport-level failures: the request itself could not be
/// completed. A reply that arrived but makes no sense is not an error; it
/// comes back as a [`ReasonerReply`] with `malformed` set and is handled
/// inside the turn loop.
#[derive(Error, Debug)]
pub enum ReasonerError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Reasoner not configured: {0}")]
    NotConfigured(String),
}

impl ReasonerError {
    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Transport failures, timeouts, rate limits, expired credentials (401),
    /// and server-side errors are retryable; a well-formed rejection of the
    /// request itself is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReasonerError::Http(_) => true,
            ReasonerError::Timeout(_) => true,
            ReasonerError::RateLimited { .. } => true,
            ReasonerError::Api { status, .. } => {
                *status == 401 || *status == 429 || (500..600).contains(status)
            }
            ReasonerError::Parse(_) => false,
            ReasonerError::NotConfigured(_) => false,
        }
    }
}

/// Generation settings for a reasoner backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasonerSettings {
    /// Model to use.
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum tokens to generate per reply.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature (0.0 for deterministic).
    #[serde(default)]
    pub temperature: f32,

    /// System prompt framing the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for ReasonerSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            system_prompt: None,
        }
    }
}

/// One tool invocation requested by the reasoner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestedCall {
    /// Tool name as the reasoner spelled it (resolved by the dispatcher).
    pub name: String,

    /// Raw arguments, validated downstream.
    #[serde(default)]
    pub arguments: Value,
}

impl RequestedCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Normalized reply envelope, independent of the backend's wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasonerReply {
    /// Free text, present on final answers (and alongside tool calls when
    /// the model narrates its plan).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Tool invocations requested this turn, in request order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<RequestedCall>,

    /// Set when the backend refused the request (safety or policy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<String>,

    /// Set when the reply arrived but could not be interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
}

impl ReasonerReply {
    /// A final free-text answer.
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// A turn requesting tool invocations.
    pub fn calls(tool_calls: Vec<RequestedCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    /// A refusal with the backend's stated reason.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: Some(reason.into()),
            ..Self::default()
        }
    }

    /// An uninterpretable reply with diagnostic detail.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            malformed: Some(detail.into()),
            ..Self::default()
        }
    }

    /// True when the envelope carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.tool_calls.is_empty()
            && self.blocked.is_none()
            && self.malformed.is_none()
    }
}

/// Reasoning backend behind a run.
///
/// Implementations own their transport and normalization; they never retry
/// internally (retry policy lives with the caller, next to the budget).
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Send the conversation so far plus the advertised tool set, and wait
    /// up to `timeout` for one reply.
    async fn send(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        timeout: Duration,
    ) -> Result<ReasonerReply, ReasonerError>;

    /// Backend name for logs and metrics.
    fn name(&self) -> &str;

    /// Check if the backend is usable at all.
    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_constructors() {
        assert_eq!(ReasonerReply::answer("72F and clear").text.as_deref(), Some("72F and clear"));

        let reply = ReasonerReply::calls(vec![RequestedCall::new(
            "current_conditions",
            json!({ "station": "KSEA" }),
        )]);
        assert_eq!(reply.tool_calls.len(), 1);
        assert!(reply.text.is_none());

        assert!(ReasonerReply::blocked("policy").blocked.is_some());
        assert!(ReasonerReply::malformed("truncated JSON").malformed.is_some());
        assert!(ReasonerReply::default().is_empty());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ReasonerError::Http("connection reset".to_string()).is_retryable());
        assert!(ReasonerError::Timeout(Duration::from_secs(15)).is_retryable());
        assert!(ReasonerError::RateLimited { retry_after: None }.is_retryable());
        assert!(ReasonerError::Api { status: 401, message: "expired".to_string() }.is_retryable());
        assert!(ReasonerError::Api { status: 503, message: "overloaded".to_string() }.is_retryable());

        assert!(!ReasonerError::Api { status: 400, message: "bad request".to_string() }.is_retryable());
        assert!(!ReasonerError::Api { status: 403, message: "forbidden".to_string() }.is_retryable());
        assert!(!ReasonerError::Parse("unexpected EOF".to_string()).is_retryable());
        assert!(!ReasonerError::NotConfigured("no key".to_string()).is_retryable());
    }

    #[test]
    fn test_reply_envelope_serde_shape() {
        let reply = ReasonerReply::calls(vec![RequestedCall::new("run_forecast", json!({}))]);
        let value = serde_json::to_value(&reply).unwrap();
        assert!(value.get("text").is_none());
        assert_eq!(value["tool_calls"][0]["name"], "run_forecast");

        let parsed: ReasonerReply = serde_json::from_value(json!({ "text": "done" })).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("done"));
        assert!(parsed.tool_calls.is_empty());
    }
}
