//! # trail-core
//!
//! Provider-agnostic step engine for tool-using LLM agents.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           StepEngine                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌────────────┐  ┌──────────┐  │
//! │  │ LlmProvider │  │    Tool     │  │   Retry    │  │Trajectory│  │
//! │  │ (Strategy)  │──│  Registry   │──│  Backoff   │──│ Recorder │  │
//! │  └─────────────┘  └─────────────┘  └────────────┘  └──────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait lets the engine run unchanged against OpenAI,
//! Anthropic, Gemini, Ollama or any other backend. Every run produces an
//! append-only trajectory that can be loaded back to resume or branch.

pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod provider;
pub mod retry;
pub mod run;
pub mod tool;
pub mod trajectory;

pub use config::RunConfig;
pub use engine::{ArtifactProbe, EngineBuilder, GateDecision, PatchGate, StepEngine, TerminationGate};
pub use error::{AgentError, ErrorClass, Result};
pub use message::{Conversation, Message, Role};
pub use provider::{Completion, FinishReason, GenerationOptions, LlmProvider, ProviderKind, TokenUsage};
pub use retry::{Backoff, RetryPolicy};
pub use run::{AgentRun, Artifact, ArtifactKind, Task, Termination};
pub use tool::{
    ParameterSchema, TaskDoneTool, Tool, ToolCall, ToolContext, ToolRegistry, ToolResult, ToolSchema,
    TASK_DONE,
};
pub use trajectory::{
    JsonlTrajectory, MemoryTrajectory, NullTrajectory, RunHeader, RunSummary, Step, Trajectory,
    TrajectoryRecord, TrajectoryRecorder,
};

pub use tokio_util::sync::CancellationToken;
