//! Google Gemini `generateContent`
//!
//! Tool calls arrive as `functionCall` parts without stable ids, so ids are
//! minted here. Results go back as `functionResponse` parts keyed by name.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use trail_core::{
    AgentError, Completion, FinishReason, GenerationOptions, LlmProvider, Message, Result, Role,
    TokenUsage, ToolCall, ToolSchema,
};

use crate::http;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini provider
pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleProvider {
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

    fn parts(msg: &Message) -> Vec<Value> {
        if let (Role::Tool, Some(result)) = (msg.role, &msg.tool_result) {
            return vec![json!({
                "functionResponse": {
                    "name": result.name,
                    "response": {
                        "success": result.success,
                        "content": msg.content,
                    },
                },
            })];
        }

        let mut parts = Vec::new();
        if !msg.content.trim().is_empty() {
            parts.push(json!({"text": msg.content}));
        }
        for call in &msg.tool_calls {
            parts.push(json!({
                "functionCall": {"name": call.name, "args": call.arguments_json()},
            }));
        }
        parts
    }

    fn convert_contents(messages: &[Message]) -> Vec<Value> {
        let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

        for msg in messages.iter().filter(|m| m.role != Role::System) {
            let role = if msg.role == Role::Assistant { "model" } else { "user" };
            let parts = Self::parts(msg);
            if parts.is_empty() {
                continue;
            }
            match turns.last_mut() {
                Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
                _ => turns.push((role, parts)),
            }
        }

        turns
            .into_iter()
            .map(|(role, parts)| json!({"role": role, "parts": parts}))
            .collect()
    }

    fn convert_tool(schema: &ToolSchema) -> Value {
        let mut declaration = json!({
            "name": schema.name,
            "description": schema.description,
        });
        // Gemini rejects object schemas with no properties
        if !schema.parameters.is_empty() {
            declaration["parameters"] = schema.input_schema();
        }
        declaration
    }

    fn build_request(messages: &[Message], tools: &[ToolSchema], options: &GenerationOptions) -> Value {
        let mut body = json!({
            "contents": Self::convert_contents(messages),
            "generationConfig": {
                "temperature": options.temperature,
                "topP": options.top_p,
                "maxOutputTokens": options.max_tokens,
            },
        });

        let system: Vec<Value> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| json!({"text": m.content}))
            .collect();
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": system});
        }
        if !tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": tools.iter().map(Self::convert_tool).collect::<Vec<_>>(),
            }]);
        }
        if !options.stop_sequences.is_empty() {
            body["generationConfig"]["stopSequences"] = json!(options.stop_sequences);
        }
        body
    }

    fn convert_response(response: GenerateResponse, options: &GenerationOptions) -> Result<Completion> {
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Parse("response contained no candidates".into()))?;

        let mut text = Vec::new();
        let mut calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(t) = part.text {
                text.push(t);
            }
            if let Some(call) = part.function_call {
                let id = call.id.filter(|id| !id.is_empty()).unwrap_or_else(ToolCall::fresh_id);
                calls.push(ToolCall::from_json(id, call.name, call.args));
            }
        }

        let finish_reason = candidate.finish_reason.as_deref().map(|reason| match reason {
            "STOP" if !calls.is_empty() => FinishReason::ToolUse,
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
            _ => FinishReason::Error,
        });

        Ok(Completion {
            message: Message::assistant_with_calls(text.join(""), calls),
            model: response.model_version.unwrap_or_else(|| options.model.clone()),
            usage: response
                .usage_metadata
                .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count)),
            finish_reason,
        })
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn health_check(&self) -> Result<bool> {
        let request = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-goog-api-key", &self.api_key);
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
            "sending generateContent request"
        );

        let request = self
            .client
            .post(format!("{}/models/{}:generateContent", self.base_url, options.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::build_request(messages, tools, options));

        let response: GenerateResponse = http::send_json(self.name(), request).await?;
        Self::convert_response(response, options)
    }
}

// Gemini API response structures

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::{ParameterSchema, ToolResult};

    #[test]
    fn test_request_shape() {
        let tools = vec![
            ToolSchema {
                name: "bash".into(),
                description: "Run a command".into(),
                parameters: vec![ParameterSchema::required("command", "string", "Command")],
            },
            ToolSchema {
                name: "task_done".into(),
                description: "Finish".into(),
                parameters: Vec::new(),
            },
        ];
        let messages = vec![
            Message::system("sys"),
            Message::user("task"),
            Message::assistant_with_calls("", vec![ToolCall::from_json("c1", "bash", json!({"command": "ls"}))]),
            Message::tool(ToolResult::success("bash", "c1", "out")),
        ];

        let body = GoogleProvider::build_request(&messages, &tools, &GenerationOptions::default());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"].as_array().unwrap().len(), 3);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["args"]["command"], "ls");
        assert_eq!(body["contents"][2]["parts"][0]["functionResponse"]["name"], "bash");

        let declarations = &body["tools"][0]["functionDeclarations"];
        assert!(declarations[0]["parameters"].is_object());
        assert!(declarations[1].get("parameters").is_none());
    }

    #[tokio::test]
    async fn test_function_calls_get_minted_ids() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-2.5-pro:generateContent")
            .match_header("x-goog-api-key", "g-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "candidates": [{
                        "content": {"role": "model", "parts": [
                            {"functionCall": {"name": "bash", "args": {"command": "ls"}}},
                            {"functionCall": {"name": "bash", "args": {"command": "pwd"}}}
                        ]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {"promptTokenCount": 40, "candidatesTokenCount": 12},
                    "modelVersion": "gemini-2.5-pro"
                }"#,
            )
            .create_async()
            .await;

        let provider =
            GoogleProvider::new("g-key", Some(format!("{}/v1beta", server.url())), Duration::from_secs(5)).unwrap();
        let options = GenerationOptions {
            model: "gemini-2.5-pro".into(),
            ..GenerationOptions::default()
        };
        let completion = provider.complete(&[Message::user("go")], &[], &options).await.unwrap();

        mock.assert_async().await;
        let calls = &completion.message.tool_calls;
        assert_eq!(calls.len(), 2);
        assert!(calls[0].id.starts_with("call_"));
        assert_ne!(calls[0].id, calls[1].id);
        assert_eq!(calls[1].str_arg("command"), Some("pwd"));
        assert_eq!(completion.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(completion.usage, Some(TokenUsage::new(40, 12)));
    }

    #[tokio::test]
    async fn test_bad_model_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1beta/models/no-such-model:generateContent")
            .with_status(404)
            .with_body(r#"{"error": {"code": 404, "status": "NOT_FOUND"}}"#)
            .create_async()
            .await;

        let provider =
            GoogleProvider::new("g-key", Some(format!("{}/v1beta", server.url())), Duration::from_secs(5)).unwrap();
        let options = GenerationOptions {
            model: "no-such-model".into(),
            ..GenerationOptions::default()
        };
        let err = provider.complete(&[Message::user("go")], &[], &options).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
        assert!(!err.is_retryable());
    }
}
