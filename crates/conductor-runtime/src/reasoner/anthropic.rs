//! Anthropic Claude reasoner implementation.
//!
//! Talks to the Messages API with tool use enabled and folds the response
//! into the normalized [`ReasonerReply`] envelope.
//!
//! ## Security
//!
//! The API key is stored in an [`ApiCredential`]:
//! - Cannot be accidentally printed via `Debug`
//! - Is zeroed on drop
//! - Must be explicitly exposed via `.expose()` at the point of use

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use conductor_core::{Conversation, Role, Segment, ToolSpec};

use super::{ApiCredential, Reasoner, ReasonerError, ReasonerReply, ReasonerSettings, RequestedCall};

/// Environment variable name for the Anthropic API key.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Anthropic Claude reasoner.
pub struct AnthropicReasoner {
    credential: ApiCredential,
    base_url: String,
    settings: ReasonerSettings,
}

impl std::fmt::Debug for AnthropicReasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicReasoner")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("model", &self.settings.model)
            .finish()
    }
}

impl AnthropicReasoner {
    /// Create a reasoner with an explicit API key.
    pub fn new(api_key: impl Into<String>, settings: ReasonerSettings) -> Self {
        Self {
            credential: ApiCredential::new(api_key, "Anthropic API key"),
            base_url: "https://api.anthropic.com/v1".to_string(),
            settings,
        }
    }

    /// Create from the `ANTHROPIC_API_KEY` environment variable.
    pub fn from_env(settings: ReasonerSettings) -> Result<Self, ReasonerError> {
        let credential = ApiCredential::from_env(ANTHROPIC_API_KEY_ENV, "Anthropic API key")?;
        Ok(Self {
            credential,
            base_url: "https://api.anthropic.com/v1".to_string(),
            settings,
        })
    }

    /// Set a custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn client(&self) -> &reqwest::Client {
        static CLIENT: std::sync::OnceLock<reqwest::Client> = std::sync::OnceLock::new();
        CLIENT.get_or_init(|| {
            reqwest::Client::builder()
                .build()
                .expect("Failed to build HTTP client")
        })
    }
}

/// Messages API request format.
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<RequestBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// Messages API response format.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[allow(dead_code)] // Correlation ids are re-minted from our own seq.
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    #[allow(dead_code)] // Required for deserialization, not read directly.
    type_: String,
    message: String,
}

// Correlation id for a tool_use/tool_result pair, derived from our seq.
fn call_id(seq: u32) -> String {
    format!("call_{seq}")
}

/// Convert our conversation into Messages API turns.
///
/// User and tool-result turns both map to role "user" (tool results ride in
/// `tool_result` content blocks), so the strict user/assistant alternation
/// the API requires falls out of the turn order the orchestrator maintains.
fn build_messages(conversation: &Conversation) -> Vec<ApiMessage> {
    conversation
        .turns()
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::Reasoner => "assistant",
                Role::User | Role::ToolResult => "user",
            };
            let content = turn
                .segments
                .iter()
                .map(|segment| match segment {
                    Segment::Text { text } => RequestBlock::Text { text: text.clone() },
                    Segment::ToolCall(request) => RequestBlock::ToolUse {
                        id: call_id(request.seq),
                        name: request.tool.clone(),
                        input: request.arguments.clone(),
                    },
                    Segment::ToolResult(result) => RequestBlock::ToolResult {
                        tool_use_id: call_id(result.seq),
                        content: match (&result.payload, &result.error) {
                            (Some(payload), _) => payload.to_string(),
                            (None, Some(fault)) => fault.to_string(),
                            (None, None) => String::new(),
                        },
                        is_error: !result.success,
                    },
                })
                .collect();
            ApiMessage { role, content }
        })
        .collect()
}

/// Fold a Messages API response into the normalized envelope.
fn normalize(body: MessagesResponse) -> ReasonerReply {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in body.content {
        match block {
            ResponseBlock::Text { text } => text_parts.push(text),
            ResponseBlock::ToolUse { name, input, .. } => {
                tool_calls.push(RequestedCall::new(name, input));
            }
            ResponseBlock::Unknown => {}
        }
    }
    let text = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join(""))
    };

    match body.stop_reason.as_deref() {
        Some("refusal") => {
            ReasonerReply::blocked(text.unwrap_or_else(|| "refused by model".to_string()))
        }
        Some("max_tokens") => ReasonerReply::malformed("reply truncated at max_tokens limit"),
        _ => ReasonerReply {
            text,
            tool_calls,
            ..ReasonerReply::default()
        },
    }
}

#[async_trait]
impl Reasoner for AnthropicReasoner {
    async fn send(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
        timeout: Duration,
    ) -> Result<ReasonerReply, ReasonerError> {
        let request = MessagesRequest {
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_tokens,
            system: self.settings.system_prompt.clone(),
            messages: build_messages(conversation),
            temperature: if self.settings.temperature == 0.0 {
                None
            } else {
                Some(self.settings.temperature)
            },
            tools: tools
                .iter()
                .map(|spec| ApiTool {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    input_schema: spec.parameters.clone(),
                })
                .collect(),
        };

        // SECURITY: only expose the credential here, at the point of use.
        let response = self
            .client()
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.credential.expose())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasonerError::Timeout(timeout)
                } else {
                    ReasonerError::Http(e.to_string())
                }
            })?;

        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ReasonerError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let error_body = response
                .json::<ApiError>()
                .await
                .map_err(|e| ReasonerError::Parse(e.to_string()))?;

            return Err(ReasonerError::Api {
                status: status.as_u16(),
                message: error_body.error.message,
            });
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ReasonerError::Parse(e.to_string()))?;

        if let Some(usage) = &body.usage {
            debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "reasoner reply received"
            );
        }

        Ok(normalize(body))
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    async fn health_check(&self) -> bool {
        // Verify the API key is set, without logging the value.
        !self.credential.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{ConversationTurn, ToolCallRequest, ToolCallResult, ToolErrorKind, ToolFault};
    use serde_json::json;

    fn parse_response(value: Value) -> MessagesResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_reasoner_creation() {
        let reasoner = AnthropicReasoner::new("test-key", ReasonerSettings::default());
        assert_eq!(reasoner.name(), "anthropic");
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret_key = "sk-ant-REDACTED";
        let reasoner = AnthropicReasoner::new(secret_key, ReasonerSettings::default());

        let debug_output = format!("{:?}", reasoner);
        assert!(
            !debug_output.contains(secret_key),
            "API key was exposed in Debug output!"
        );
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_health_check_requires_a_key() {
        let reasoner = AnthropicReasoner::new("sk-test", ReasonerSettings::default());
        assert!(reasoner.health_check().await);

        let empty = AnthropicReasoner::new("", ReasonerSettings::default());
        assert!(!empty.health_check().await);
    }

    #[test]
    fn test_text_reply_normalizes_to_answer() {
        let reply = normalize(parse_response(json!({
            "content": [
                { "type": "text", "text": "Currently 18C " },
                { "type": "text", "text": "and overcast." }
            ],
            "stop_reason": "end_turn"
        })));
        assert_eq!(reply.text.as_deref(), Some("Currently 18C and overcast."));
        assert!(reply.tool_calls.is_empty());
    }

    #[test]
    fn test_tool_use_blocks_normalize_in_order() {
        let reply = normalize(parse_response(json!({
            "content": [
                { "type": "text", "text": "Let me look that up." },
                {
                    "type": "tool_use",
                    "id": "toolu_abc",
                    "name": "current_conditions",
                    "input": { "station": "KSEA" }
                },
                {
                    "type": "tool_use",
                    "id": "toolu_def",
                    "name": "aggregate_metrics",
                    "input": { "metric": "wind_kph", "window_hours": 24, "statistic": "max" }
                }
            ],
            "stop_reason": "tool_use"
        })));
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].name, "current_conditions");
        assert_eq!(reply.tool_calls[1].name, "aggregate_metrics");
        assert_eq!(reply.text.as_deref(), Some("Let me look that up."));
    }

    #[test]
    fn test_refusal_stop_reason_normalizes_to_blocked() {
        let reply = normalize(parse_response(json!({
            "content": [{ "type": "text", "text": "I can't help with that." }],
            "stop_reason": "refusal"
        })));
        assert_eq!(reply.blocked.as_deref(), Some("I can't help with that."));
        assert!(reply.text.is_none());
    }

    #[test]
    fn test_truncated_reply_normalizes_to_malformed() {
        let reply = normalize(parse_response(json!({
            "content": [{ "type": "text", "text": "The aggregate over the last" }],
            "stop_reason": "max_tokens"
        })));
        assert!(reply.malformed.as_deref().unwrap().contains("max_tokens"));
    }

    #[test]
    fn test_unknown_content_blocks_are_tolerated() {
        let reply = normalize(parse_response(json!({
            "content": [
                { "type": "thinking", "thinking": "..." },
                { "type": "text", "text": "Done." }
            ],
            "stop_reason": "end_turn"
        })));
        assert_eq!(reply.text.as_deref(), Some("Done."));
    }

    #[test]
    fn test_conversation_maps_to_alternating_messages() {
        let request = ToolCallRequest {
            seq: 1,
            tool: "current_conditions".to_string(),
            arguments: json!({ "station": "KSEA" }),
        };
        let result = ToolCallResult::failure(
            &request,
            ToolFault::new(ToolErrorKind::Timeout, "timed out after 10000ms"),
            Duration::from_millis(10_000),
            None,
        );

        let mut conversation = Conversation::opening("weather in Seattle?");
        conversation.push(ConversationTurn::reasoner(vec![
            Segment::text("Checking."),
            Segment::ToolCall(request),
        ]));
        conversation.push(ConversationTurn::tool_results(vec![result]));

        let messages = build_messages(&conversation);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[2].role, "user");

        let wire = serde_json::to_value(&messages).unwrap();
        assert_eq!(wire[1]["content"][1]["type"], "tool_use");
        assert_eq!(wire[1]["content"][1]["id"], "call_1");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "call_1");
        assert_eq!(wire[2]["content"][0]["is_error"], true);
        assert_eq!(
            wire[2]["content"][0]["content"],
            "TIMEOUT: timed out after 10000ms"
        );
    }

    #[test]
    fn test_tool_specs_serialize_with_input_schema() {
        let spec = ToolSpec {
            name: "run_forecast".to_string(),
            description: "Projected values".to_string(),
            parameters: json!({ "type": "object" }),
        };
        let tool = ApiTool {
            name: spec.name.clone(),
            description: spec.description.clone(),
            input_schema: spec.parameters.clone(),
        };
        let wire = serde_json::to_value(&tool).unwrap();
        assert_eq!(wire["input_schema"]["type"], "object");
    }
}
