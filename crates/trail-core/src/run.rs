//! Run Model
//!
//! The task handed to the engine and the session it produces.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::TokenUsage;
use crate::trajectory::Step;

/// What the run is asked to do and where
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Problem statement shown to the model
    pub description: String,

    /// Directory every tool invocation is confined to
    pub working_dir: PathBuf,

    /// Commit the produced patch is diffed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            description: description.into(),
            working_dir: working_dir.into(),
            base_commit: None,
        }
    }

    #[must_use]
    pub fn with_base_commit(mut self, commit: impl Into<String>) -> Self {
        self.base_commit = Some(commit.into());
        self
    }

    /// Seed user message: project root and problem statement
    pub fn seed_prompt(&self) -> String {
        format!(
            "[Project root path]:\n{}\n\n[Problem statement]: We're currently solving the following issue within our repository. Here's the issue text:\n{}\n",
            self.working_dir.display(),
            self.description
        )
    }
}

/// Why a run stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The termination tool was accepted
    TaskDone,
    /// Step budget used up
    MaxStepsExceeded,
    /// Step budget used up without the required artifact
    MustPatchUnsatisfied,
    /// Unrecoverable provider, protocol or recorder failure
    FatalError,
    /// Cooperative cancellation observed at a step boundary
    Cancelled,
}

impl Termination {
    pub const fn is_success(self) -> bool {
        matches!(self, Self::TaskDone)
    }

    /// Process exit status for the CLI layer
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::TaskDone => 0,
            Self::FatalError => 1,
            Self::MaxStepsExceeded => 2,
            Self::MustPatchUnsatisfied => 3,
            Self::Cancelled => 130,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskDone => "task_done",
            Self::MaxStepsExceeded => "max_steps_exceeded",
            Self::MustPatchUnsatisfied => "must_patch_unsatisfied",
            Self::FatalError => "fatal_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of artifact a run produced
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Unified diff of the working directory
    Patch,
    /// Candidate id chosen by a selection run
    Selection,
}

/// Final output of a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub content: String,
}

impl Artifact {
    pub fn patch(content: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Patch,
            content: content.into(),
        }
    }

    pub fn selection(content: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Selection,
            content: content.into(),
        }
    }
}

/// A finished session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: String,
    pub task: Task,
    pub provider: String,
    pub model: String,

    /// Completed steps, indices contiguous from 0
    pub steps: Vec<Step>,

    /// Set exactly once, when the run leaves the running state
    pub termination: Termination,

    /// Classified description for `fatal_error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    #[serde(default)]
    pub usage: TokenUsage,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AgentRun {
    pub const fn succeeded(&self) -> bool {
        self.termination.is_success()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}
