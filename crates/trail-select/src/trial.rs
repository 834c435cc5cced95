//! Per-trial environments
//!
//! Every selection trial needs a working directory for its tools and a
//! trajectory target. [`GitWorktrees`] gives each trial its own checkout;
//! the shared variants hand every trial the same directory, which makes the
//! pipeline run trials one at a time.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use trail_core::{JsonlTrajectory, NullTrajectory, TrajectoryRecorder};

use crate::error::{Result, SelectError};

/// Identifies one selection run
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrialKey {
    pub group: usize,
    pub trial: u32,
}

/// Resources for one trial
pub struct TrialSetup {
    pub working_dir: PathBuf,
    pub recorder: Arc<dyn TrajectoryRecorder>,
}

#[async_trait]
pub trait TrialEnvironment: Send + Sync {
    async fn prepare(&self, key: TrialKey) -> Result<TrialSetup>;

    /// Called after the trial's run finished, whatever its outcome
    async fn release(&self, _key: TrialKey) -> Result<()> {
        Ok(())
    }

    /// Every trial gets the same working directory; such trials never
    /// overlap
    fn shares_working_dir(&self) -> bool {
        false
    }
}

/// `<root>/group_<g>/trial_<t>.jsonl`
pub fn trajectory_path(root: &Path, key: TrialKey) -> PathBuf {
    root.join(format!("group_{}", key.group))
        .join(format!("trial_{}.jsonl", key.trial))
}

/// Every trial uses the same directory and records nothing
#[derive(Clone, Debug)]
pub struct SharedCheckout {
    working_dir: PathBuf,
}

impl SharedCheckout {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl TrialEnvironment for SharedCheckout {
    async fn prepare(&self, _key: TrialKey) -> Result<TrialSetup> {
        Ok(TrialSetup {
            working_dir: self.working_dir.clone(),
            recorder: Arc::new(NullTrajectory),
        })
    }

    fn shares_working_dir(&self) -> bool {
        true
    }
}

/// Shared working directory, one JSONL trajectory per trial
///
/// Files land at `<root>/group_<g>/trial_<t>.jsonl`.
#[derive(Clone, Debug)]
pub struct TrajectoryDir {
    working_dir: PathBuf,
    root: PathBuf,
}

impl TrajectoryDir {
    pub fn new(working_dir: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            root: root.into(),
        }
    }

    pub fn path_for(&self, key: TrialKey) -> PathBuf {
        trajectory_path(&self.root, key)
    }
}

#[async_trait]
impl TrialEnvironment for TrajectoryDir {
    async fn prepare(&self, key: TrialKey) -> Result<TrialSetup> {
        let recorder = JsonlTrajectory::create(self.path_for(key))?;
        Ok(TrialSetup {
            working_dir: self.working_dir.clone(),
            recorder: Arc::new(recorder),
        })
    }

    fn shares_working_dir(&self) -> bool {
        true
    }
}

/// One detached `git worktree` per trial
///
/// Worktrees are checked out at the base commit (or `HEAD`) under `root`
/// and removed again when the trial is released. Trajectories are written
/// under the optional trajectory root with the [`trajectory_path`] layout.
#[derive(Clone, Debug)]
pub struct GitWorktrees {
    repo: PathBuf,
    root: PathBuf,
    base_commit: Option<String>,
    trajectories: Option<PathBuf>,
}

impl GitWorktrees {
    pub fn new(repo: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            root: root.into(),
            base_commit: None,
            trajectories: None,
        }
    }

    #[must_use]
    pub fn with_base_commit(mut self, commit: impl Into<String>) -> Self {
        self.base_commit = Some(commit.into());
        self
    }

    #[must_use]
    pub fn with_trajectories(mut self, root: impl Into<PathBuf>) -> Self {
        self.trajectories = Some(root.into());
        self
    }

    pub fn worktree_for(&self, key: TrialKey) -> PathBuf {
        self.root.join(format!("group_{}_trial_{}", key.group, key.trial))
    }

    /// Absolute, since git resolves relative paths against the repository
    fn checkout_path(&self, key: TrialKey) -> Result<PathBuf> {
        Ok(std::path::absolute(self.worktree_for(key))?)
    }

    async fn git(&self, args: &[&OsStr]) -> Result<()> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SelectError::Environment(format!(
                "git {} failed: {}",
                args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let args = [OsStr::new("worktree"), OsStr::new("remove"), OsStr::new("--force"), path.as_os_str()];
        self.git(&args).await
    }
}

#[async_trait]
impl TrialEnvironment for GitWorktrees {
    async fn prepare(&self, key: TrialKey) -> Result<TrialSetup> {
        let path = self.checkout_path(key)?;
        if path.exists() {
            // Left behind by an earlier attempt
            if let Err(err) = self.remove(&path).await {
                tracing::debug!(path = %path.display(), error = %err, "stale worktree not registered");
                tokio::fs::remove_dir_all(&path).await?;
            }
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let base = self.base_commit.as_deref().unwrap_or("HEAD");
        let args = [
            OsStr::new("worktree"),
            OsStr::new("add"),
            OsStr::new("--force"),
            OsStr::new("--detach"),
            path.as_os_str(),
            OsStr::new(base),
        ];
        self.git(&args).await?;
        tracing::debug!(group = key.group, trial = key.trial, path = %path.display(), "worktree ready");

        let recorder: Arc<dyn TrajectoryRecorder> = match &self.trajectories {
            Some(root) => Arc::new(JsonlTrajectory::create(trajectory_path(root, key))?),
            None => Arc::new(NullTrajectory),
        };
        Ok(TrialSetup {
            working_dir: path,
            recorder,
        })
    }

    async fn release(&self, key: TrialKey) -> Result<()> {
        self.remove(&self.checkout_path(key)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trajectory_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let env = TrajectoryDir::new("/repo", dir.path());
        let key = TrialKey { group: 1, trial: 2 };

        let setup = env.prepare(key).await.unwrap();
        assert_eq!(setup.working_dir, PathBuf::from("/repo"));
        assert!(dir.path().join("group_1/trial_2.jsonl").is_file());
        assert!(env.shares_working_dir());
    }

    fn run_git(root: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(root)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        run_git(root, &["init", "-q"]);
        run_git(root, &["config", "user.name", "Trail Test"]);
        run_git(root, &["config", "user.email", "trail@local.invalid"]);
        std::fs::write(root.join("calc.py"), "x = 0\n").unwrap();
        run_git(root, &["add", "."]);
        run_git(root, &["commit", "-q", "-m", "init"]);
        dir
    }

    #[tokio::test]
    async fn test_concurrent_trials_get_separate_worktrees() {
        let repo = repo();
        let scratch = tempfile::tempdir().unwrap();
        let env = GitWorktrees::new(repo.path(), scratch.path().join("worktrees"))
            .with_trajectories(scratch.path().join("trajectories"));
        assert!(!env.shares_working_dir());

        let first = TrialKey { group: 0, trial: 0 };
        let second = TrialKey { group: 0, trial: 1 };
        let (a, b) = tokio::join!(env.prepare(first), env.prepare(second));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.working_dir, b.working_dir);
        std::fs::write(a.working_dir.join("calc.py"), "x = 1\n").unwrap();
        assert_eq!(std::fs::read_to_string(b.working_dir.join("calc.py")).unwrap(), "x = 0\n");
        assert_eq!(std::fs::read_to_string(repo.path().join("calc.py")).unwrap(), "x = 0\n");
        assert!(scratch.path().join("trajectories/group_0/trial_1.jsonl").is_file());

        env.release(first).await.unwrap();
        env.release(second).await.unwrap();
        assert!(!a.working_dir.exists());
        assert!(!b.working_dir.exists());
    }

    #[tokio::test]
    async fn test_worktree_is_recreated_for_a_retry() {
        let repo = repo();
        let scratch = tempfile::tempdir().unwrap();
        let env = GitWorktrees::new(repo.path(), scratch.path());
        let key = TrialKey { group: 2, trial: 0 };

        let setup = env.prepare(key).await.unwrap();
        std::fs::write(setup.working_dir.join("calc.py"), "x = 9\n").unwrap();

        let again = env.prepare(key).await.unwrap();
        assert_eq!(std::fs::read_to_string(again.working_dir.join("calc.py")).unwrap(), "x = 0\n");
        env.release(key).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_repository_is_an_environment_error() {
        let scratch = tempfile::tempdir().unwrap();
        let env = GitWorktrees::new(scratch.path().join("nowhere"), scratch.path().join("worktrees"));
        let err = env.prepare(TrialKey { group: 0, trial: 0 }).await.err().unwrap();
        assert!(matches!(err, SelectError::Environment(_) | SelectError::Io(_)));
    }
}
