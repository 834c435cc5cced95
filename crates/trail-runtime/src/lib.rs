//! # trail-runtime
//!
//! Concrete backends and integrations for the trail step engine.
//!
//! ## Providers
//!
//! - **OpenAI-compatible** (`openai`, `openrouter`, `doubao`): JSON-embedded tool calls
//! - **Anthropic**: `tool_use` content blocks
//! - **Google Gemini**: `functionCall` parts
//! - **Ollama** (default feature): local inference, tool calls embedded in text
//!
//! ## Usage
//!
//! ```rust,ignore
//! use trail_runtime::{build_provider, ProviderSettings};
//!
//! let kind = ProviderKind::Anthropic;
//! let provider = build_provider(kind, ProviderSettings::from_env(kind))?;
//! let engine = StepEngine::builder()
//!     .provider(provider)
//!     .tool(BashTool::new())
//!     .probe(Arc::new(GitDiffProbe::new()))
//!     .build()?;
//! ```

pub mod anthropic;
pub mod bash;
pub mod factory;
pub mod git;
pub mod google;
mod http;
pub mod openai;

#[cfg(feature = "ollama")]
pub mod ollama;

pub use anthropic::AnthropicProvider;
pub use bash::BashTool;
pub use factory::{build_provider, ProviderSettings};
pub use git::GitDiffProbe;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;

#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;

// Re-export core types for convenience
pub use trail_core::{
    AgentError, AgentRun, LlmProvider, Message, ProviderKind, Result, Role, RunConfig, StepEngine,
    Task, Termination, Tool, ToolRegistry,
};
