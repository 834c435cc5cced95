//! OpenAI-compatible chat completions
//!
//! Serves `openai`, `openrouter` and `doubao`. Tool calls arrive as
//! `tool_calls[].function.arguments`, a JSON object encoded as a string.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use trail_core::{
    AgentError, Completion, FinishReason, GenerationOptions, LlmProvider, Message, ProviderKind,
    Result, Role, TokenUsage, ToolCall, ToolSchema,
};

use crate::http;

/// Public endpoint per backend
pub fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
        ProviderKind::Doubao => "https://ark.cn-beijing.volces.com/api/v3",
        _ => "https://api.openai.com/v1",
    }
}

/// OpenAI-compatible provider
pub struct OpenAiProvider {
    kind: ProviderKind,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(
        kind: ProviderKind,
        api_key: impl Into<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            client: http::client(timeout)?,
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or_else(|| default_base_url(kind).to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn convert_message(msg: &Message) -> Value {
        match msg.role {
            Role::System => json!({"role": "system", "content": msg.content}),
            Role::User => json!({"role": "user", "content": msg.content}),
            Role::Assistant if msg.has_tool_calls() => {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments_json().to_string(),
                            },
                        })
                    })
                    .collect();
                let content = if msg.content.is_empty() { Value::Null } else { json!(msg.content) };
                json!({"role": "assistant", "content": content, "tool_calls": calls})
            }
            Role::Assistant => json!({"role": "assistant", "content": msg.content}),
            Role::Tool => match &msg.tool_result {
                Some(result) => json!({
                    "role": "tool",
                    "tool_call_id": result.call_id,
                    "content": msg.content,
                }),
                None => json!({"role": "user", "content": msg.content}),
            },
        }
    }

    fn convert_tool(schema: &ToolSchema) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": schema.name,
                "description": schema.description,
                "parameters": schema.input_schema(),
            },
        })
    }

    fn build_request(messages: &[Message], tools: &[ToolSchema], options: &GenerationOptions) -> Value {
        let mut body = json!({
            "model": options.model,
            "messages": messages.iter().map(Self::convert_message).collect::<Vec<_>>(),
            "temperature": options.temperature,
            "top_p": options.top_p,
            "max_tokens": options.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(Self::convert_tool).collect());
        }
        if !options.stop_sequences.is_empty() {
            body["stop"] = json!(options.stop_sequences);
        }
        body
    }

    fn convert_response(response: ChatResponse, options: &GenerationOptions) -> Result<Completion> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Parse("response contained no choices".into()))?;

        let calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let id = call.id.filter(|id| !id.is_empty()).unwrap_or_else(ToolCall::fresh_id);
                let call = ToolCall::from_raw(id, call.function.name, &call.function.arguments);
                if let Some(error) = &call.arguments_error {
                    tracing::warn!(tool = %call.name, error = %error, "malformed tool-call arguments");
                }
                call
            })
            .collect();

        Ok(Completion {
            message: Message::assistant_with_calls(choice.message.content.unwrap_or_default(), calls),
            model: response.model.unwrap_or_else(|| options.model.clone()),
            usage: response
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            finish_reason: choice.finish_reason.as_deref().map(finish_reason),
        })
    }
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Error,
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn health_check(&self) -> Result<bool> {
        let request = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key);
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
            "sending chat completion"
        );

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&Self::build_request(messages, tools, options));

        let response: ChatResponse = http::send_json(self.name(), request).await?;
        Self::convert_response(response, options)
    }
}

// OpenAI API response structures

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
