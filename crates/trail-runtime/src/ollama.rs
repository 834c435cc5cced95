//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference. Tool calling is
//! embedded in text: descriptors are rendered into the system prompt and
//! calls are parsed back out of fenced `tool` blocks.

use async_trait::async_trait;
use ollama_rs::{
    generation::chat::{request::ChatMessageRequest, ChatMessage, MessageRole},
    models::ModelOptions,
    Ollama,
};
use serde::Deserialize;
use trail_core::{
    tool::render_tool_prompt,
    AgentError, Completion, FinishReason, GenerationOptions, LlmProvider, Message, Result, Role,
    ToolCall, ToolSchema,
};

const TOOL_FENCE: &str = "```tool";
const FENCE_END: &str = "```";

/// Ollama provider configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost".into());
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);

        Self { host, port }
    }

    /// Split `http://host:port` into host and port
    ///
    /// IPv6 hosts must be bracketed (`http://[::1]:11434`).
    pub fn from_url(url: &str) -> Result<Self> {
        let url = url.trim().trim_end_matches('/');
        let scheme_end = url.find("://").map_or(0, |i| i + 3);
        let authority = &url[scheme_end..];

        let (host, port) = match authority.strip_prefix('[') {
            Some(rest) => {
                let close = rest
                    .find(']')
                    .ok_or_else(|| AgentError::Config(format!("unclosed IPv6 host in '{url}'")))?;
                let after = &rest[close + 1..];
                let port = match after.strip_prefix(':') {
                    Some(port) => Some(port),
                    None if after.is_empty() => None,
                    None => return Err(AgentError::Config(format!("invalid Ollama host '{url}'"))),
                };
                (&authority[..close + 2], port)
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };

        let port = match port {
            Some(port) => port
                .parse()
                .map_err(|_| AgentError::Config(format!("invalid Ollama port in '{url}'")))?,
            None => Self::default().port,
        };
        Ok(Self {
            host: format!("{}{host}", &url[..scheme_end]),
            port,
        })
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Ollama,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Self {
        Self {
            client: Ollama::new(&config.host, config.port),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::from_config(OllamaConfig::from_env())
    }

    pub const fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Render the conversation as plain chat turns
    ///
    /// Tool descriptors join the system prompt, assistant calls are written
    /// back as fenced blocks and tool results become user turns.
    fn convert_messages(messages: &[Message], tools: &[ToolSchema]) -> Vec<ChatMessage> {
        let tool_section = (!tools.is_empty()).then(|| render_tool_prompt(tools));
        let mut converted = Vec::with_capacity(messages.len() + 1);
        let mut injected = false;

        for msg in messages {
            let (role, content) = match msg.role {
                Role::System => {
                    let mut content = msg.content.clone();
                    if let Some(section) = tool_section.as_deref().filter(|_| !injected) {
                        content.push_str("\n\n");
                        content.push_str(section);
                        injected = true;
                    }
                    (MessageRole::System, content)
                }
                Role::User => (MessageRole::User, msg.content.clone()),
                Role::Assistant => (MessageRole::Assistant, render_calls(msg)),
                // Tools appear as user context
                Role::Tool => (MessageRole::User, msg.content.clone()),
            };
            converted.push(ChatMessage::new(role, content));
        }

        if let Some(section) = tool_section.filter(|_| !injected) {
            converted.insert(0, ChatMessage::new(MessageRole::System, section));
        }
        converted
    }

    fn build_request(messages: &[Message], tools: &[ToolSchema], options: &GenerationOptions) -> ChatMessageRequest {
        ChatMessageRequest::new(options.model.clone(), Self::convert_messages(messages, tools))
            .options(model_options(options))
    }

    /// Convert Ollama reply text to an assistant message
    fn convert_completion(content: String, model: &str) -> Completion {
        let calls = parse_tool_calls(&content);
        let finish_reason = if calls.is_empty() { FinishReason::Stop } else { FinishReason::ToolUse };
        Completion {
            message: Message::assistant_with_calls(content, calls),
            model: model.to_string(),
            usage: None,
            finish_reason: Some(finish_reason),
        }
    }
}

/// Sampling settings in Ollama's terms; `max_tokens` maps to `num_predict`
fn model_options(options: &GenerationOptions) -> ModelOptions {
    let model_options = ModelOptions::default()
        .temperature(options.temperature)
        .top_p(options.top_p)
        .num_predict(i32::try_from(options.max_tokens).unwrap_or(i32::MAX));
    if options.stop_sequences.is_empty() {
        model_options
    } else {
        model_options.stop(options.stop_sequences.clone())
    }
}

fn render_calls(msg: &Message) -> String {
    let mut content = msg.content.clone();
    // Replies from this backend already carry their blocks
    if content.contains(TOOL_FENCE) {
        return content;
    }
    for call in &msg.tool_calls {
        let block = serde_json::json!({"tool": call.name, "arguments": call.arguments_json()});
        content.push_str(&format!("\n{TOOL_FENCE}\n{block}\n{FENCE_END}"));
    }
    content
}

/// Tool call as written by the model
#[derive(Deserialize)]
struct TextCall {
    #[serde(alias = "name")]
    tool: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

impl TextCall {
    fn into_call(self) -> ToolCall {
        ToolCall::from_json(ToolCall::fresh_id(), self.tool, self.arguments)
    }
}

/// Every fenced `tool` block in order, or a single inline JSON call
pub(crate) fn parse_tool_calls(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find(TOOL_FENCE) {
        let after = &rest[start + TOOL_FENCE.len()..];
        let Some(end) = after.find(FENCE_END) else {
            break;
        };
        let block = after[..end].trim();
        match serde_json::from_str::<TextCall>(block) {
            Ok(call) => calls.push(call.into_call()),
            Err(e) => {
                let name = name_hint(block).unwrap_or("unknown");
                tracing::warn!(tool = name, error = %e, "malformed tool block");
                calls.push(ToolCall::malformed(ToolCall::fresh_id(), name, e.to_string()));
            }
        }
        rest = &after[end + FENCE_END.len()..];
    }

    if calls.is_empty() {
        calls.extend(parse_inline_tool_call(content));
    }
    calls
}

/// Tool name from a block that is not valid JSON, when it can be spotted
fn name_hint(block: &str) -> Option<&str> {
    ["\"tool\"", "\"name\""].iter().find_map(|key| {
        let rest = block[block.find(key)? + key.len()..].trim_start().strip_prefix(':')?;
        let rest = rest.trim_start().strip_prefix('"')?;
        rest.find('"').map(|end| &rest[..end]).filter(|name| !name.is_empty())
    })
}

/// Fallback: raw JSON object with a `"tool"` key
fn parse_inline_tool_call(content: &str) -> Option<ToolCall> {
    if !content.contains(r#""tool""#) {
        return None;
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str::<TextCall>(&content[start..=end])
        .ok()
        .map(TextCall::into_call)
}

/// ollama-rs reports failures as text; sort them by what they say
fn classify(err: impl std::fmt::Display) -> AgentError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("not found") || lower.contains("invalid") {
        AgentError::Provider(message)
    } else if lower.contains("unauthorized") || lower.contains("forbidden") {
        AgentError::Auth(message)
    } else {
        AgentError::ProviderUnavailable(message)
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.list_local_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
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
            "sending chat request"
        );

        let request = Self::build_request(messages, tools, options);
        let response = self.client.send_chat_messages(request).await.map_err(classify)?;

        Ok(Self::convert_completion(response.message.content, &options.model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::{ParameterSchema, ToolResult};

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
    }

    #[test]
    fn test_config_from_url() {
        let config = OllamaConfig::from_url("http://gpu-box:11500/").unwrap();
        assert_eq!(config.host, "http://gpu-box");
        assert_eq!(config.port, 11500);

        let config = OllamaConfig::from_url("http://gpu-box").unwrap();
        assert_eq!(config.port, 11434);

        assert!(OllamaConfig::from_url("http://gpu-box:abc").is_err());
    }

    #[test]
    fn test_config_from_ipv6_url() {
        let config = OllamaConfig::from_url("http://[::1]").unwrap();
        assert_eq!(config.host, "http://[::1]");
        assert_eq!(config.port, 11434);

        let config = OllamaConfig::from_url("http://[fe80::2]:11500/").unwrap();
        assert_eq!(config.host, "http://[fe80::2]");
        assert_eq!(config.port, 11500);

        assert!(OllamaConfig::from_url("http://[::1").is_err());
        assert!(OllamaConfig::from_url("http://[::1]x").is_err());
    }

    #[test]
    fn test_request_carries_generation_options() {
        let options = GenerationOptions {
            model: "llama3.1".into(),
            temperature: 0.25,
            max_tokens: 512,
            top_p: 0.5,
            stop_sequences: vec!["</done>".into()],
        };
        let request = OllamaProvider::build_request(&[Message::user("Hi")], &[], &options);

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["model"], "llama3.1");
        assert_eq!(wire["options"]["temperature"], 0.25);
        assert_eq!(wire["options"]["top_p"], 0.5);
        assert_eq!(wire["options"]["num_predict"], 512);
        assert_eq!(wire["options"]["stop"], serde_json::json!(["</done>"]));

        let plain = serde_json::to_value(OllamaProvider::build_request(&[], &[], &GenerationOptions::default())).unwrap();
        assert!(plain["options"].get("stop").is_none());
    }

    #[test]
    fn test_malformed_block_becomes_failing_call() {
        let content = "Running it.\n```tool\n{\"tool\": \"bash\", \"arguments\": {\"command\": \"ls\"\n```";
        let calls = parse_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "bash");
        assert!(calls[0].arguments_error.is_some());
        assert!(calls[0].argument_failure().unwrap().error.unwrap().contains("Malformed arguments"));

        let calls = parse_tool_calls("```tool\nnot json at all\n```");
        assert_eq!(calls[0].name, "unknown");
        assert!(calls[0].arguments_error.is_some());
    }

    #[test]
    fn test_parse_fenced_blocks_in_order() {
        let content = r#"Let me look first.
```tool
{"tool": "bash", "arguments": {"command": "ls"}}
```
Then finish.
```tool
{"tool": "task_done", "arguments": {}}
```"#;
        let calls = parse_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "bash");
        assert_eq!(calls[0].str_arg("command"), Some("ls"));
        assert_eq!(calls[1].name, "task_done");
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn test_parse_inline_call() {
        let calls = parse_tool_calls(r#"Sure: {"tool": "bash", "arguments": {"command": "pwd"}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].str_arg("command"), Some("pwd"));

        assert!(parse_tool_calls("No tools needed, the answer is 4.").is_empty());
    }

    #[test]
    fn test_tool_prompt_joins_system_message() {
        let tools = vec![ToolSchema {
            name: "bash".into(),
            description: "Run a command".into(),
            parameters: vec![ParameterSchema::required("command", "string", "Command")],
        }];
        let messages = vec![
            Message::system("You are helpful."),
            Message::user("Hello"),
            Message::tool(ToolResult::success("bash", "c1", "ok")),
        ];

        let converted = OllamaProvider::convert_messages(&messages, &tools);
        assert_eq!(converted.len(), 3);
        assert!(converted[0].content.contains("### bash"));
        assert!(converted[2].content.starts_with("[Tool 'bash' returned]"));
    }

    #[test]
    fn test_assistant_calls_are_written_back_as_blocks() {
        let msg = Message::assistant_with_calls(
            "checking",
            vec![ToolCall::from_json("c1", "bash", serde_json::json!({"command": "ls"}))],
        );
        let text = render_calls(&msg);
        assert_eq!(parse_tool_calls(&text)[0].str_arg("command"), Some("ls"));
    }

    #[test]
    fn test_error_classification() {
        assert!(classify("error sending request: connection refused").is_retryable());
        assert!(!classify("model 'llama9' not found").is_retryable());
    }
}
