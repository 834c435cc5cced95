//! Tool System
//!
//! Uniform `(arguments) -> ToolResult` contract for agent capabilities.
//! The registry never aborts a run: unknown tools, bad arguments and tool
//! failures all come back as a failed [`ToolResult`] the model can read.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Name of the designated voluntary-termination tool
pub const TASK_DONE: &str = "task_done";

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the model response
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Arguments as key-value pairs
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,

    /// Set when the model's arguments could not be read as a JSON object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_error: Option<String>,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            arguments_error: None,
        }
    }

    /// A call whose arguments were unreadable; it is answered with a failed
    /// result and never reaches the tool
    pub fn malformed(id: impl Into<String>, name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            arguments_error: Some(error.into()),
            ..Self::new(id, name, BTreeMap::new())
        }
    }

    /// Build a call from a JSON value; `null` means no arguments and any
    /// other non-object value marks the call malformed
    pub fn from_json(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        match arguments {
            serde_json::Value::Object(map) => Self::new(id, name, map.into_iter().collect()),
            serde_json::Value::Null => Self::new(id, name, BTreeMap::new()),
            other => Self::malformed(id, name, format!("expected a JSON object, got {other}")),
        }
    }

    /// Build a call from arguments encoded as a JSON string
    pub fn from_raw(id: impl Into<String>, name: impl Into<String>, raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::new(id, name, BTreeMap::new());
        }
        match serde_json::from_str(raw) {
            Ok(value) => Self::from_json(id, name, value),
            Err(e) => Self::malformed(id, name, e.to_string()),
        }
    }

    /// Mint a call id for backends that do not supply one
    pub fn fresh_id() -> String {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    }

    /// Arguments rendered as a JSON object
    pub fn arguments_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.arguments.clone().into_iter().collect())
    }

    /// String argument lookup
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }

    /// Failed result answering a malformed call
    pub fn argument_failure(&self) -> Option<ToolResult> {
        self.arguments_error.as_ref().map(|error| {
            ToolResult::failure(
                &self.name,
                &self.id,
                format!(
                    "Malformed arguments for tool '{}': {error}. Send the arguments as a single JSON object.",
                    self.name
                ),
            )
        })
    }
}

/// Result from tool execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Call this result answers
    pub call_id: String,

    /// Tool that was called
    pub name: String,

    /// Whether execution succeeded
    pub success: bool,

    /// Text payload
    #[serde(default)]
    pub output: String,

    /// Structured payload (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(
        name: impl Into<String>,
        call_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            success: true,
            output: output.into(),
            data: None,
            error: None,
        }
    }

    pub fn failure(
        name: impl Into<String>,
        call_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            success: false,
            output: String::new(),
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Text shown to the model for this result
    pub fn render(&self) -> String {
        let mut text = if self.success {
            format!("[Tool '{}' returned]\n", self.name)
        } else {
            format!("[Tool '{}' failed]\n", self.name)
        };
        if let Some(error) = &self.error {
            text.push_str(error);
            text.push('\n');
        }
        if !self.output.is_empty() {
            text.push_str(&self.output);
            text.push('\n');
        }
        if let Some(data) = &self.data {
            text.push_str(&data.to_string());
            text.push('\n');
        }
        text.trim_end().to_string()
    }
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, integer, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
}

impl ParameterSchema {
    pub fn required(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: true,
            enum_values: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }
}

/// Provider-neutral tool descriptor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter definitions
    pub parameters: Vec<ParameterSchema>,
}

impl ToolSchema {
    /// Render the parameters as a JSON Schema object
    pub fn input_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut prop = serde_json::json!({
                "type": param.param_type,
                "description": param.description,
            });
            if let Some(values) = &param.enum_values {
                prop["enum"] = serde_json::Value::Array(values.clone());
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Per-run execution scope handed to every tool invocation
#[derive(Clone, Debug)]
pub struct ToolContext {
    /// Directory the run is confined to
    pub working_dir: PathBuf,

    /// Deadline for a single invocation
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with given arguments
    ///
    /// Return `Ok` with a failed result for expected failures (nonzero exit,
    /// missing file); an `Err` is also folded into a failed result.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult>;

    /// Validate arguments before execution (optional)
    fn validate(&self, call: &ToolCall) -> Result<()> {
        let schema = self.schema();

        for param in &schema.parameters {
            if param.required && !call.arguments.contains_key(&param.name) {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter '{}' for tool '{}'",
                    param.name, schema.name
                )));
            }
        }

        Ok(())
    }
}

/// Registry for available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        self.tools.insert(schema.name, tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Restrict to the named tools, always keeping `keep`
    pub fn subset(&self, names: &BTreeSet<String>, keep: &str) -> Self {
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| names.contains(*name) || name.as_str() == keep)
            .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
            .collect();
        Self { tools }
    }

    /// Execute a tool call; every outcome is a `ToolResult`
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            let err = AgentError::ToolNotFound(call.name.clone());
            tracing::warn!(tool = %call.name, "model requested an unknown tool");
            return ToolResult::failure(
                &call.name,
                &call.id,
                format!("{err}. Available tools: {}", self.names().join(", ")),
            );
        };

        if let Some(result) = call.argument_failure() {
            tracing::warn!(tool = %call.name, "tool arguments malformed");
            return result;
        }

        if let Err(err) = tool.validate(call) {
            tracing::warn!(tool = %call.name, error = %err, "tool arguments rejected");
            return ToolResult::failure(&call.name, &call.id, err.to_string());
        }

        let outcome = match ctx.timeout {
            Some(limit) => tokio::time::timeout(limit, tool.execute(call, ctx))
                .await
                .unwrap_or(Err(AgentError::Timeout(limit))),
            None => tool.execute(call, ctx).await,
        };

        match outcome {
            Ok(mut result) => {
                result.call_id.clone_from(&call.id);
                result.name.clone_from(&call.name);
                result
            }
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool execution failed");
                ToolResult::failure(&call.name, &call.id, err.to_string())
            }
        }
    }

    /// Get all tool schemas, ordered by name
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    /// Get tool names, ordered
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Render tool descriptors for backends without native tool calling
pub fn render_tool_prompt(schemas: &[ToolSchema]) -> String {
    let mut prompt = String::from("## Available Tools\n\n");
    prompt.push_str("You can use the following tools by responding with one JSON block per call:\n\n");
    prompt.push_str("```tool\n{\"tool\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}\n```\n\n");

    for schema in schemas {
        prompt.push_str(&format!("### {}\n{}\n", schema.name, schema.description));

        if !schema.parameters.is_empty() {
            prompt.push_str("**Parameters:**\n");
            for param in &schema.parameters {
                let required = if param.required { " (required)" } else { "" };
                prompt.push_str(&format!(
                    "- `{}` ({}){}: {}\n",
                    param.name, param.param_type, required, param.description
                ));
            }
        }
        prompt.push('\n');
    }

    prompt
}

// ============================================================================
// Built-in Tools
// ============================================================================

/// Signals voluntary termination; intercepted by the engine, never dispatched
pub struct TaskDoneTool;

#[async_trait]
impl Tool for TaskDoneTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: TASK_DONE.into(),
            description: "Report that you have finished the task. Only call this once the \
                          problem is solved and verified."
                .into(),
            parameters: Vec::new(),
        }
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<ToolResult> {
        Ok(ToolResult::success(TASK_DONE, &call.id, "Task done."))
    }
}
