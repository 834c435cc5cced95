//! Environment-driven settings
//!
//! Everything the binary needs is read once at startup from `TRAIL_*`
//! variables (after `.env` is loaded) and turned into the library configs.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context};
use trail_core::{ProviderKind, RunConfig, Task};
use trail_select::EnsembleConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct AgentSettings {
    pub task: String,
    pub project_path: PathBuf,
    pub base_commit: Option<String>,
    pub provider: ProviderKind,
    pub model: String,
    pub max_steps: Option<u32>,
    pub max_retries: Option<u32>,
    pub must_patch: bool,
    pub tools: Option<Vec<String>>,
    pub trajectory: Option<PathBuf>,
    pub patch_path: Option<PathBuf>,
    /// JSONL candidate file; switches the binary to selection mode
    pub candidates: Option<PathBuf>,
    /// Where selection trials get their worktrees; a temp dir when unset
    pub worktree_dir: Option<PathBuf>,
    pub ensemble: EnsembleConfig,
}

/// Model used when `TRAIL_MODEL` is not set
pub const fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "gpt-4o",
        ProviderKind::OpenRouter => "anthropic/claude-sonnet-4",
        ProviderKind::Doubao => "doubao-seed-1-6-250615",
        ProviderKind::Anthropic => "claude-sonnet-4-20250514",
        ProviderKind::Google => "gemini-2.5-pro",
        ProviderKind::Ollama => "llama3.1",
    }
}

fn parse<T>(name: &str, value: Option<String>) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| v.trim().parse::<T>().map_err(|e| anyhow::anyhow!("{name}: {e}")))
        .transpose()
}

fn flag(name: &str, value: Option<String>) -> anyhow::Result<Option<bool>> {
    value
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{name}: expected a boolean, got '{other}'"),
        })
        .transpose()
}

impl AgentSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let task = match (var("TRAIL_TASK"), var("TRAIL_TASK_FILE")) {
            (Some(task), _) => task,
            (None, Some(path)) => std::fs::read_to_string(&path)
                .with_context(|| format!("reading TRAIL_TASK_FILE {path}"))?,
            (None, None) => bail!("TRAIL_TASK or TRAIL_TASK_FILE must be set"),
        };

        let provider = match var("TRAIL_PROVIDER") {
            Some(name) => ProviderKind::from_str(&name)?,
            None => ProviderKind::Anthropic,
        };

        let mut ensemble = EnsembleConfig::default();
        if let Some(size) = parse("TRAIL_GROUP_SIZE", var("TRAIL_GROUP_SIZE"))? {
            ensemble.group_size = size;
        }
        if let Some(voting) = flag("TRAIL_MAJORITY_VOTING", var("TRAIL_MAJORITY_VOTING"))? {
            ensemble.majority_voting = voting;
        }
        if let Some(trials) = parse("TRAIL_TRIALS", var("TRAIL_TRIALS"))? {
            ensemble.trials = trials;
        }
        if let Some(workers) = parse("TRAIL_MAX_WORKERS", var("TRAIL_MAX_WORKERS"))? {
            ensemble.max_workers = workers;
        }
        if let Some(steps) = parse("TRAIL_SELECT_MAX_STEPS", var("TRAIL_SELECT_MAX_STEPS"))? {
            ensemble.max_steps = steps;
        }
        if let Some(retries) = parse("TRAIL_SELECT_MAX_RETRIES", var("TRAIL_SELECT_MAX_RETRIES"))? {
            ensemble.max_retries = retries;
        }

        Ok(Self {
            task,
            project_path: var("TRAIL_PROJECT_PATH").map_or_else(|| PathBuf::from("."), PathBuf::from),
            base_commit: var("TRAIL_BASE_COMMIT"),
            model: var("TRAIL_MODEL").unwrap_or_else(|| default_model(provider).to_string()),
            provider,
            max_steps: parse("TRAIL_MAX_STEPS", var("TRAIL_MAX_STEPS"))?,
            max_retries: parse("TRAIL_MAX_RETRIES", var("TRAIL_MAX_RETRIES"))?,
            must_patch: flag("TRAIL_MUST_PATCH", var("TRAIL_MUST_PATCH"))?.unwrap_or(false),
            tools: var("TRAIL_TOOLS").map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            }),
            trajectory: var("TRAIL_TRAJECTORY").map(PathBuf::from),
            patch_path: var("TRAIL_PATCH_PATH").map(PathBuf::from),
            candidates: var("TRAIL_CANDIDATES").map(PathBuf::from),
            worktree_dir: var("TRAIL_WORKTREE_DIR").map(PathBuf::from),
            ensemble,
        })
    }

    pub fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::for_model(self.provider, self.model.clone()).with_must_patch(self.must_patch);
        if let Some(steps) = self.max_steps {
            config = config.with_max_steps(steps);
        }
        if let Some(retries) = self.max_retries {
            config = config.with_max_retries(retries);
        }
        if let Some(tools) = &self.tools {
            config = config.with_tool_subset(tools.iter().cloned());
        }
        config
    }

    pub fn task(&self) -> Task {
        let task = Task::new(self.task.clone(), self.project_path.clone());
        match &self.base_commit {
            Some(commit) => task.with_base_commit(commit.clone()),
            None => task,
        }
    }
}
