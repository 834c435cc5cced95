//! Step Engine
//!
//! Drives one run: compose the conversation, call the model (through the
//! retry controller), dispatch the returned tool calls in order, record the
//! step, evaluate termination. Steps are strictly sequential. Cancellation is
//! only observed between steps.
//!
//! ```text
//!            ┌──────────────── RUNNING ────────────────┐
//!            │ compose → model → dispatch → record      │
//!            └──┬──────────┬──────────────┬─────────┬──┘
//!     fatal/exhausted   termination     budget    cancel
//!               │        accepted         │         │
//!        DONE(fatal)   DONE(success)  DONE(max_steps |  DONE(cancelled)
//!                                     must_patch_unsatisfied)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::RunConfig;
use crate::error::{AgentError, Result};
use crate::message::{Conversation, Message};
use crate::provider::{Completion, LlmProvider, TokenUsage};
use crate::retry;
use crate::run::{AgentRun, Artifact, Task, Termination};
use crate::tool::{TaskDoneTool, Tool, ToolCall, ToolContext, ToolRegistry, ToolResult, TASK_DONE};
use crate::trajectory::{NullTrajectory, RunHeader, RunSummary, Step, TrajectoryRecorder};

/// Appended when a step produced no tool calls
pub const NUDGE_MESSAGE: &str = "It seems that you have not completed the task.";

/// Returned for termination attempts without a patch under `must_patch`
pub const EMPTY_PATCH_MESSAGE: &str =
    "ERROR! Your Patch is empty. Please provide a patch that fixes the problem.";

/// Result text for calls emitted after the terminating call
pub const SKIPPED_CALL_MESSAGE: &str = "not executed: the run terminated earlier in this step";

const DEFAULT_SYSTEM_PROMPT: &str = r"You are an expert software engineering agent working inside a code repository.

Your job is to resolve the issue described by the user. Work in small, verifiable steps:
1. Explore the repository to understand the relevant code.
2. Reproduce the problem before changing anything.
3. Make a minimal, targeted fix.
4. Verify the fix and check for regressions.

Use the provided tools for every action; you cannot act without them.
Always use absolute paths rooted at the project root you are given.
When the issue is resolved and verified, call `task_done`.";

// ============================================================================
// Termination gate
// ============================================================================

/// Produces the run's artifact from its working directory
#[async_trait]
pub trait ArtifactProbe: Send + Sync {
    /// `None` when nothing has been produced yet
    async fn capture(&self, task: &Task) -> Result<Option<Artifact>>;
}

/// Outcome of a termination attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Run ends with success, carrying the artifact if any
    Accept(Option<Artifact>),
    /// Run continues; the reason goes back to the model as a failed result
    Reject(String),
}

/// Decides whether a termination-tool call ends the run
#[async_trait]
pub trait TerminationGate: Send + Sync {
    async fn evaluate(&self, call: &ToolCall, task: &Task, config: &RunConfig) -> Result<GateDecision>;

    /// Artifact reported when the step budget runs out
    async fn final_artifact(&self, _task: &Task) -> Option<Artifact> {
        None
    }
}

/// Default gate: accepts `task_done`, insisting on a patch under `must_patch`
#[derive(Clone, Default)]
pub struct PatchGate {
    probe: Option<Arc<dyn ArtifactProbe>>,
}

impl PatchGate {
    pub fn new(probe: Option<Arc<dyn ArtifactProbe>>) -> Self {
        Self { probe }
    }

    async fn artifact(&self, task: &Task) -> Option<Artifact> {
        let probe = self.probe.as_ref()?;
        match probe.capture(task).await {
            Ok(artifact) => artifact.filter(|a| !a.content.trim().is_empty()),
            Err(err) => {
                tracing::warn!(error = %err, "artifact probe failed");
                None
            }
        }
    }
}

#[async_trait]
impl TerminationGate for PatchGate {
    async fn evaluate(&self, _call: &ToolCall, task: &Task, config: &RunConfig) -> Result<GateDecision> {
        let artifact = self.artifact(task).await;
        if config.must_patch && artifact.is_none() {
            return Ok(GateDecision::Reject(EMPTY_PATCH_MESSAGE.into()));
        }
        Ok(GateDecision::Accept(artifact))
    }

    async fn final_artifact(&self, task: &Task) -> Option<Artifact> {
        self.artifact(task).await
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The agent loop
pub struct StepEngine {
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    gate: Arc<dyn TerminationGate>,
    recorder: Arc<dyn TrajectoryRecorder>,
    config: RunConfig,
    cancel: CancellationToken,
}

/// Mutable state of a run in progress
struct RunState {
    conversation: Conversation,
    steps: Vec<Step>,
    pending: Vec<Message>,
    usage: TokenUsage,
}

/// How a step ended
enum StepOutcome {
    Continue,
    Done(Option<Artifact>),
}

impl StepEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Run a task from a fresh seed conversation
    pub async fn run(&self, task: Task) -> AgentRun {
        let seed = vec![
            Message::system(self.system_prompt()),
            Message::user(task.seed_prompt()),
        ];
        let state = RunState {
            conversation: Conversation::new(),
            steps: Vec::new(),
            pending: seed,
            usage: TokenUsage::default(),
        };
        self.drive(task, state).await
    }

    /// Continue from `prior[..from_index]`, possibly with another provider
    ///
    /// The kept steps are re-recorded into this engine's recorder before the
    /// loop resumes at `from_index`.
    pub async fn resume(&self, task: Task, prior: &[Step], from_index: usize) -> Result<AgentRun> {
        if from_index == 0 {
            return Ok(self.run(task).await);
        }
        if from_index > prior.len() {
            return Err(AgentError::Config(format!(
                "cannot resume at step {from_index}: trajectory has {} steps",
                prior.len()
            )));
        }
        if u32::try_from(from_index).map_or(true, |n| n >= self.config.max_steps) {
            return Err(AgentError::Config(format!(
                "cannot resume at step {from_index}: max_steps is {}",
                self.config.max_steps
            )));
        }

        let kept = &prior[..from_index];
        for (expected, step) in kept.iter().enumerate() {
            if usize::try_from(step.index).ok() != Some(expected) || !step.is_resolved() {
                return Err(AgentError::Trajectory(format!(
                    "step {expected} is out of order or has unresolved tool calls"
                )));
            }
        }

        let mut state = RunState {
            conversation: Conversation::new(),
            steps: Vec::with_capacity(kept.len()),
            pending: Vec::new(),
            usage: TokenUsage::default(),
        };
        for step in kept {
            state.conversation.extend(step.input.iter().cloned());
            state.conversation.push(step.response.clone());
            if let Some(usage) = step.usage {
                state.usage += usage;
            }
            state.steps.push(step.clone());
        }
        state.pending = kept.last().map(pending_after).unwrap_or_default();

        Ok(self.drive(task, state).await)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Token for cooperative cancellation of runs on this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn system_prompt(&self) -> String {
        self.config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.into())
    }

    async fn drive(&self, task: Task, state: RunState) -> AgentRun {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("run", run_id = %run_id, provider = self.provider.name());
        self.drive_inner(run_id, task, state).instrument(span).await
    }

    async fn drive_inner(&self, run_id: String, task: Task, mut state: RunState) -> AgentRun {
        let header = RunHeader {
            run_id: run_id.clone(),
            task: task.clone(),
            provider: self.provider.name().to_string(),
            model: self.config.model().to_string(),
            max_steps: self.config.max_steps,
            started_at: Utc::now(),
        };
        tracing::info!(
            model = %header.model,
            max_steps = header.max_steps,
            resumed_steps = state.steps.len(),
            "run started"
        );

        let mut error = None;
        let mut artifact = None;

        let termination = match self.begin(&header, &state.steps) {
            Err(err) => {
                error = Some(err.to_string());
                Termination::FatalError
            }
            Ok(()) => loop {
                if self.cancel.is_cancelled() {
                    tracing::info!(step = state.steps.len(), "run cancelled at step boundary");
                    break Termination::Cancelled;
                }
                if u32::try_from(state.steps.len()).map_or(true, |n| n >= self.config.max_steps) {
                    let (reason, produced) = self.budget_termination(&task).await;
                    artifact = produced;
                    break reason;
                }

                match self.step(&task, &mut state).await {
                    Ok(StepOutcome::Continue) => {}
                    Ok(StepOutcome::Done(produced)) => {
                        artifact = produced;
                        break Termination::TaskDone;
                    }
                    Err(err) => {
                        tracing::error!(step = state.steps.len(), error = %err, "run failed");
                        error = Some(err.to_string());
                        break Termination::FatalError;
                    }
                }
            },
        };

        let summary = RunSummary {
            termination,
            error: error.clone(),
            artifact: artifact.clone(),
            usage: state.usage,
            finished_at: Utc::now(),
        };
        if let Err(err) = self.recorder.finish(&summary) {
            tracing::error!(error = %err, "failed to record run summary");
        }
        tracing::info!(
            termination = %termination,
            steps = state.steps.len(),
            total_tokens = state.usage.total_tokens,
            "run finished"
        );

        AgentRun {
            run_id,
            task,
            provider: header.provider,
            model: header.model,
            steps: state.steps,
            termination,
            error,
            artifact,
            usage: state.usage,
            started_at: header.started_at,
            finished_at: summary.finished_at,
        }
    }

    fn begin(&self, header: &RunHeader, resumed: &[Step]) -> Result<()> {
        self.recorder.start(header)?;
        for step in resumed {
            self.recorder.record(step)?;
        }
        Ok(())
    }

    async fn budget_termination(&self, task: &Task) -> (Termination, Option<Artifact>) {
        let artifact = self.gate.final_artifact(task).await;
        let reason = if self.config.must_patch && artifact.is_none() {
            Termination::MustPatchUnsatisfied
        } else {
            Termination::MaxStepsExceeded
        };
        tracing::warn!(termination = %reason, "step budget exhausted");
        (reason, artifact)
    }

    /// One iteration; `Err` is fatal to the run
    async fn step(&self, task: &Task, state: &mut RunState) -> Result<StepOutcome> {
        let index = u32::try_from(state.steps.len()).unwrap_or(u32::MAX);
        let input = std::mem::take(&mut state.pending);
        state.conversation.extend(input.iter().cloned());

        let completion = self.call_model(state.conversation.messages(), index).await?;
        let Completion {
            mut message,
            model,
            usage,
            ..
        } = completion;

        for call in &mut message.tool_calls {
            if call.id.is_empty() {
                call.id = ToolCall::fresh_id();
            }
        }
        state.conversation.push(message.clone());
        if let Some(usage) = usage {
            state.usage += usage;
        }

        let calls = message.tool_calls.clone();
        tracing::debug!(step = index, tool_calls = calls.len(), "model responded");
        let (results, accepted) = self.dispatch(task, &calls, index).await;

        let step = Step {
            index,
            input,
            response: message,
            tool_calls: calls,
            tool_results: results,
            model: if model.is_empty() { self.config.model().to_string() } else { model },
            usage,
            timestamp: Utc::now(),
        };
        self.recorder.record(&step)?;
        state.pending = pending_after(&step);
        state.steps.push(step);

        Ok(match accepted {
            Some(artifact) => StepOutcome::Done(artifact),
            None => StepOutcome::Continue,
        })
    }

    async fn call_model(&self, messages: &[Message], step: u32) -> Result<Completion> {
        let policy = self.config.retry_policy();
        let timeout = self.config.model_timeout();
        let schemas = self.tools.schemas();
        let schemas = schemas.as_slice();

        retry::attempt(&policy, |attempt| {
            let request = self.provider.complete(messages, schemas, &self.config.generation);
            async move {
                tracing::debug!(step, attempt, "calling model");
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, request)
                        .await
                        .unwrap_or(Err(AgentError::Timeout(limit))),
                    None => request.await,
                }
            }
        })
        .await
    }

    /// Execute calls in emission order; the second value is set when the
    /// termination tool was accepted
    async fn dispatch(
        &self,
        task: &Task,
        calls: &[ToolCall],
        step: u32,
    ) -> (Vec<ToolResult>, Option<Option<Artifact>>) {
        let mut ctx = ToolContext::new(&task.working_dir);
        ctx.timeout = self.config.tool_timeout();

        let mut results = Vec::with_capacity(calls.len());
        let mut accepted = None;

        for call in calls {
            if accepted.is_some() {
                results.push(ToolResult::failure(&call.name, &call.id, SKIPPED_CALL_MESSAGE));
                continue;
            }

            if let Some(result) = call.argument_failure() {
                tracing::warn!(step, tool = %call.name, "tool arguments malformed");
                results.push(result);
                continue;
            }

            if call.name == self.config.termination_tool {
                let result = match self.gate.evaluate(call, task, &self.config).await {
                    Ok(GateDecision::Accept(artifact)) => {
                        tracing::info!(step, tool = %call.name, "termination accepted");
                        accepted = Some(artifact);
                        ToolResult::success(&call.name, &call.id, "Task completed.")
                    }
                    Ok(GateDecision::Reject(reason)) => {
                        tracing::warn!(step, tool = %call.name, reason = %reason, "termination rejected");
                        ToolResult::failure(&call.name, &call.id, reason)
                    }
                    Err(err) => {
                        tracing::warn!(step, tool = %call.name, error = %err, "termination check failed");
                        ToolResult::failure(&call.name, &call.id, err.to_string())
                    }
                };
                results.push(result);
                continue;
            }

            tracing::debug!(step, tool = %call.name, call_id = %call.id, "executing tool");
            let result = self.tools.execute(call, &ctx).await;
            if !result.success {
                tracing::warn!(step, tool = %call.name, "tool reported failure");
            }
            results.push(result);
        }

        (results, accepted)
    }
}

/// Messages queued for the step after `step`
fn pending_after(step: &Step) -> Vec<Message> {
    if step.tool_results.is_empty() {
        vec![Message::user(NUDGE_MESSAGE)]
    } else {
        step.tool_results.iter().cloned().map(Message::tool).collect()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`StepEngine`]
pub struct EngineBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    gate: Option<Arc<dyn TerminationGate>>,
    probe: Option<Arc<dyn ArtifactProbe>>,
    recorder: Option<Arc<dyn TrajectoryRecorder>>,
    config: RunConfig,
    cancel: Option<CancellationToken>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: ToolRegistry::new(),
            gate: None,
            probe: None,
            recorder: None,
            config: RunConfig::default(),
            cancel: None,
        }
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.register(tool);
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Replace the default [`PatchGate`]
    #[must_use]
    pub fn gate(mut self, gate: Arc<dyn TerminationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Artifact source for the default [`PatchGate`]
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn ArtifactProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn recorder(mut self, recorder: Arc<dyn TrajectoryRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    #[must_use]
    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Result<StepEngine> {
        self.config.validate()?;
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;

        let mut tools = self.tools;
        let termination = self.config.termination_tool.as_str();
        if !tools.contains(termination) {
            if termination == TASK_DONE {
                tools.register(TaskDoneTool);
            } else {
                return Err(AgentError::Config(format!(
                    "termination tool '{termination}' is not registered"
                )));
            }
        }
        if let Some(names) = &self.config.enable_tool_subset {
            tools = tools.subset(names, termination);
        }

        let gate = match self.gate {
            Some(gate) => gate,
            None => {
                if self.config.must_patch && self.probe.is_none() {
                    return Err(AgentError::Config(
                        "must_patch requires an artifact probe".into(),
                    ));
                }
                Arc::new(PatchGate::new(self.probe))
            }
        };

        Ok(StepEngine {
            provider,
            tools,
            gate,
            recorder: self.recorder.unwrap_or_else(|| Arc::new(NullTrajectory)),
            config: self.config,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}
