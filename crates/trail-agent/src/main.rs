//! trail agent runner
//!
//! Runs one agent against a repository, or, when `TRAIL_CANDIDATES` points
//! at a candidate file, one ensemble selection over those patches. The
//! process exit code reports how the run terminated.

mod settings;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trail_core::{
    CancellationToken, JsonlTrajectory, LlmProvider, NullTrajectory, StepEngine, TrajectoryRecorder,
};
use trail_runtime::{build_provider, BashTool, GitDiffProbe, ProviderSettings, ToolRegistry};
use trail_select::{EnsemblePipeline, GitWorktrees};

use crate::settings::AgentSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let settings = AgentSettings::from_env()?;
    let provider = build_provider(settings.provider, ProviderSettings::from_env(settings.provider))?;

    match provider.health_check().await {
        Ok(true) => tracing::info!(provider = %settings.provider, model = %settings.model, "provider reachable"),
        Ok(false) | Err(_) => {
            tracing::warn!(provider = %settings.provider, "provider health check failed, continuing anyway");
        }
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next step boundary");
            on_signal.cancel();
        }
    });

    let code = match settings.candidates.clone() {
        Some(path) => select(&settings, provider, cancel, &path).await?,
        None => solve(&settings, provider, cancel).await?,
    };
    std::process::exit(code);
}

/// One agent run on the task; exit code follows the termination reason
async fn solve(
    settings: &AgentSettings,
    provider: Arc<dyn LlmProvider>,
    cancel: CancellationToken,
) -> anyhow::Result<i32> {
    let recorder: Arc<dyn TrajectoryRecorder> = match &settings.trajectory {
        Some(path) => Arc::new(
            JsonlTrajectory::create(path)
                .with_context(|| format!("creating trajectory file {}", path.display()))?,
        ),
        None => Arc::new(NullTrajectory),
    };

    let engine = StepEngine::builder()
        .provider(provider)
        .tool(BashTool::new())
        .probe(Arc::new(GitDiffProbe::new()))
        .recorder(recorder)
        .config(settings.run_config())
        .cancellation(cancel)
        .build()?;

    let run = engine.run(settings.task()).await;

    if let (Some(path), Some(artifact)) = (&settings.patch_path, &run.artifact) {
        std::fs::write(path, &artifact.content)
            .with_context(|| format!("writing patch to {}", path.display()))?;
        tracing::info!(path = %path.display(), "patch written");
    }

    match &run.error {
        Some(error) => tracing::error!(termination = %run.termination, error = %error, "run failed"),
        None => tracing::info!(
            termination = %run.termination,
            steps = run.step_count(),
            total_tokens = run.usage.total_tokens,
            "run complete"
        ),
    }
    Ok(run.termination.exit_code())
}

/// Ensemble selection over a candidate file; prints the outcome as JSON
///
/// Every trial reviews the candidates in its own worktree of the project.
async fn select(
    settings: &AgentSettings,
    provider: Arc<dyn LlmProvider>,
    cancel: CancellationToken,
    candidates: &std::path::Path,
) -> anyhow::Result<i32> {
    let candidates = trail_select::candidate::load(candidates)
        .with_context(|| format!("loading candidates from {}", candidates.display()))?;

    let worktrees = settings.worktree_dir.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("trail-worktrees-{}", std::process::id()))
    });
    let mut environment = GitWorktrees::new(settings.project_path.clone(), worktrees.clone());
    if let Some(commit) = &settings.base_commit {
        environment = environment.with_base_commit(commit.clone());
    }
    if let Some(dir) = &settings.trajectory {
        environment = environment.with_trajectories(dir.clone());
    }

    let mut tools = ToolRegistry::new();
    tools.register(BashTool::new());

    let outcome = EnsemblePipeline::new(provider, tools, Arc::new(environment))
        .with_config(settings.ensemble.clone())
        .with_run_config(settings.run_config())
        .with_cancellation(cancel)
        .select(&settings.task, candidates)
        .await;
    // Only succeeds once every worktree was released
    if std::fs::remove_dir(&worktrees).is_ok() {
        tracing::debug!(path = %worktrees.display(), "worktree root removed");
    }
    let outcome = outcome?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(0)
}
