//! Run Configuration
//!
//! One immutable value per run, resolved by the caller and passed down by
//! reference. Nothing in the engine reads configuration from anywhere else.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::provider::{GenerationOptions, ProviderKind};
use crate::retry::{Backoff, RetryPolicy};
use crate::tool::TASK_DONE;

/// Settings for a single run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Hard bound on steps per run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Additional model-call attempts after a transient failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Reject termination until an artifact exists
    #[serde(default)]
    pub must_patch: bool,

    /// Restrict the registry to these tools (termination tool always kept)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_tool_subset: Option<BTreeSet<String>>,

    #[serde(default = "default_provider")]
    pub model_provider: ProviderKind,

    /// Model id and sampling parameters
    #[serde(flatten)]
    pub generation: GenerationOptions,

    /// Deadline per provider attempt, in seconds
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: Option<u64>,

    /// Deadline per tool invocation, in seconds
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: Option<u64>,

    #[serde(default)]
    pub backoff: Backoff,

    /// Tool whose invocation ends the run
    #[serde(default = "default_termination_tool")]
    pub termination_tool: String,

    /// Replaces the built-in system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

const fn default_max_steps() -> u32 { 200 }
const fn default_max_retries() -> u32 { 10 }
const fn default_provider() -> ProviderKind { ProviderKind::Anthropic }
#[allow(clippy::unnecessary_wraps)]
const fn default_model_timeout_secs() -> Option<u64> { Some(300) }
#[allow(clippy::unnecessary_wraps)]
const fn default_tool_timeout_secs() -> Option<u64> { Some(120) }
fn default_termination_tool() -> String { TASK_DONE.into() }

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_retries: default_max_retries(),
            must_patch: false,
            enable_tool_subset: None,
            model_provider: default_provider(),
            generation: GenerationOptions::default(),
            model_timeout_secs: default_model_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            backoff: Backoff::default(),
            termination_tool: default_termination_tool(),
            system_prompt: None,
        }
    }
}

impl RunConfig {
    /// Defaults for the given backend and model
    pub fn for_model(provider: ProviderKind, model: impl Into<String>) -> Self {
        let mut config = Self {
            model_provider: provider,
            ..Self::default()
        };
        config.generation.model = model.into();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(AgentError::Config("max_steps must be at least 1".into()));
        }
        if self.generation.model.trim().is_empty() {
            return Err(AgentError::Config("model must not be empty".into()));
        }
        if self.termination_tool.trim().is_empty() {
            return Err(AgentError::Config("termination_tool must not be empty".into()));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(AgentError::Config("backoff multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    pub fn model(&self) -> &str {
        &self.generation.model
    }

    /// Retry policy for model calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff.clone())
    }

    pub fn model_timeout(&self) -> Option<Duration> {
        self.model_timeout_secs.map(Duration::from_secs)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub const fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_must_patch(mut self, must_patch: bool) -> Self {
        self.must_patch = must_patch;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_termination_tool(mut self, name: impl Into<String>) -> Self {
        self.termination_tool = name.into();
        self
    }

    #[must_use]
    pub fn with_tool_subset(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enable_tool_subset = Some(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
