//! Anthropic messages API
//!
//! System messages go in the dedicated `system` field. Tool calls come back
//! as `tool_use` content blocks; results are sent as `tool_result` blocks in
//! a user turn. Consecutive turns of the same role are merged, since the
//! API requires alternation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use trail_core::{
    AgentError, Completion, FinishReason, GenerationOptions, LlmProvider, Message, Result, Role,
    TokenUsage, ToolCall, ToolSchema,
};

use crate::http;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Claude provider
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::client(timeout)?,
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn system_prompt(messages: &[Message]) -> Option<String> {
        let parts: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    fn content_blocks(msg: &Message) -> Vec<Value> {
        let mut blocks = Vec::new();
        match (msg.role, &msg.tool_result) {
            (Role::Tool, Some(result)) => blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": result.call_id,
                "content": msg.content,
                "is_error": !result.success,
            })),
            _ => {
                if !msg.content.trim().is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content}));
                }
                for call in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments_json(),
                    }));
                }
            }
        }
        blocks
    }

    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

        for msg in messages.iter().filter(|m| m.role != Role::System) {
            let role = if msg.role == Role::Assistant { "assistant" } else { "user" };
            let blocks = Self::content_blocks(msg);
            if blocks.is_empty() {
                continue;
            }
            match turns.last_mut() {
                Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
                _ => turns.push((role, blocks)),
            }
        }

        turns
            .into_iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect()
    }

    fn build_request(messages: &[Message], tools: &[ToolSchema], options: &GenerationOptions) -> Value {
        let mut body = json!({
            "model": options.model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": Self::convert_messages(messages),
        });
        if let Some(system) = Self::system_prompt(messages) {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema(),
                    })
                })
                .collect();
        }
        if !options.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(options.stop_sequences);
        }
        body
    }

    fn convert_response(response: MessagesResponse) -> Result<Completion> {
        if response.content.is_empty() && response.stop_reason.is_none() {
            return Err(AgentError::Parse("response contained no content".into()));
        }

        let mut text = Vec::new();
        let mut calls = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text: t } => text.push(t),
                ContentBlock::ToolUse { id, name, input } => {
                    let id = if id.is_empty() { ToolCall::fresh_id() } else { id };
                    calls.push(ToolCall::from_json(id, name, input));
                }
                ContentBlock::Other => {}
            }
        }

        Ok(Completion {
            message: Message::assistant_with_calls(text.join("\n"), calls),
            model: response.model,
            usage: response
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            finish_reason: response.stop_reason.as_deref().map(|reason| match reason {
                "end_turn" | "stop_sequence" => FinishReason::Stop,
                "max_tokens" => FinishReason::Length,
                "tool_use" => FinishReason::ToolUse,
                "refusal" => FinishReason::ContentFilter,
                _ => FinishReason::Error,
            }),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn health_check(&self) -> Result<bool> {
        let request = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION);
        match http::send_json::<Value>(self.name(), request).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(provider = self.name(), error = %e, "health check failed");
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        tracing::debug!(
            provider = self.name(),
            model = %options.model,
            message_count = messages.len(),
            tool_count = tools.len(),
            "sending messages request"
        );

        let request = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::build_request(messages, tools, options));

        let response: MessagesResponse = http::send_json(self.name(), request).await?;
        Self::convert_response(response)
    }
}

// Anthropic API response structures

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::ToolResult;

    #[test]
    fn test_tool_results_merge_into_one_user_turn() {
        let calls = vec![
            ToolCall::from_json("tu_1", "bash", json!({"command": "ls"})),
            ToolCall::from_json("tu_2", "bash", json!({"command": "pwd"})),
        ];
        let messages = vec![
            Message::system("be brief"),
            Message::user("task"),
            Message::assistant_with_calls("checking", calls),
            Message::tool(ToolResult::success("bash", "tu_1", "a.txt")),
            Message::tool(ToolResult::failure("bash", "tu_2", "exit status 1")),
        ];

        let turns = AnthropicProvider::convert_messages(&messages);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1]["content"][1]["type"], "tool_use");
        assert_eq!(turns[1]["content"][1]["input"]["command"], "ls");

        let results = turns[2]["content"].as_array().unwrap();
        assert_eq!(turns[2]["role"], "user");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["tool_use_id"], "tu_2");
        assert_eq!(results[1]["is_error"], true);

        assert_eq!(AnthropicProvider::system_prompt(&messages).as_deref(), Some("be brief"));
    }

    #[tokio::test]
    async fn test_complete_maps_tool_use_blocks() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-ant-test")
            .match_header("anthropic-version", API_VERSION)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "id": "msg_01",
                    "type": "message",
                    "role": "assistant",
                    "model": "claude-sonnet-4-20250514",
                    "content": [
                        {"type": "text", "text": "Running the tests."},
                        {"type": "tool_use", "id": "toolu_01", "name": "bash",
                         "input": {"command": "cargo test"}}
                    ],
                    "stop_reason": "tool_use",
                    "usage": {"input_tokens": 321, "output_tokens": 45}
                }"#,
            )
            .create_async()
            .await;

        let provider = AnthropicProvider::new(
            "sk-ant-test",
            Some(format!("{}/v1", server.url())),
            Duration::from_secs(5),
        )
        .unwrap();
        let completion = provider
            .complete(&[Message::user("run tests")], &[], &GenerationOptions::default())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(completion.message.content, "Running the tests.");
        assert_eq!(completion.message.tool_calls[0].id, "toolu_01");
        assert_eq!(completion.message.tool_calls[0].str_arg("command"), Some("cargo test"));
        assert_eq!(completion.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(completion.usage, Some(TokenUsage::new(321, 45)));
    }

    #[tokio::test]
    async fn test_overloaded_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(529)
            .with_body(r#"{"type": "error", "error": {"type": "overloaded_error"}}"#)
            .create_async()
            .await;

        let provider =
            AnthropicProvider::new("k", Some(format!("{}/v1", server.url())), Duration::from_secs(5)).unwrap();
        let err = provider
            .complete(&[Message::user("hi")], &[], &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ProviderUnavailable(_)));
    }
}
