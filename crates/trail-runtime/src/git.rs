//! Git-diff artifact probe
//!
//! The patch a run produced is the working tree's `git diff` (or the diff
//! from the task's base commit to `HEAD`), with hunks touching test files
//! removed so the patch never interferes with acceptance tests.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use trail_core::{AgentError, Artifact, ArtifactProbe, Result, Task};

/// Path fragments that mark a file as a test
const TEST_PATTERNS: [&str; 5] = ["/test/", "/tests/", "/testing/", "test_", "tox.ini"];

/// Captures the working tree diff as a patch artifact
#[derive(Clone, Debug)]
pub struct GitDiffProbe {
    exclude_tests: bool,
}

impl Default for GitDiffProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GitDiffProbe {
    pub const fn new() -> Self {
        Self { exclude_tests: true }
    }

    /// Keep changes to test files in the patch
    #[must_use]
    pub const fn including_tests(mut self) -> Self {
        self.exclude_tests = false;
        self
    }

    /// Raw diff text; empty when the directory is not a repository
    pub async fn diff(&self, working_dir: &Path, base_commit: Option<&str>) -> Result<String> {
        if !working_dir.is_dir() {
            return Ok(String::new());
        }

        let mut command = Command::new("git");
        command.arg("--no-pager").arg("diff").current_dir(working_dir);
        if let Some(base) = base_commit {
            command.arg(base).arg("HEAD");
        }

        let output = command
            .output()
            .await
            .map_err(|e| AgentError::ToolExecution(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            tracing::debug!(
                cwd = %working_dir.display(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "git diff failed"
            );
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Drop every file section whose target path looks like a test
pub fn remove_patches_to_tests(patch: &str) -> String {
    let mut kept = String::with_capacity(patch.len());
    let mut in_test_file = false;

    for line in patch.split_inclusive('\n') {
        if line.starts_with("diff --git a/") {
            let target = line.split_whitespace().last().unwrap_or_default();
            in_test_file =
                target.starts_with("b/") && TEST_PATTERNS.iter().any(|p| target.contains(p));
        }
        if !in_test_file {
            kept.push_str(line);
        }
    }
    kept
}

#[async_trait]
impl ArtifactProbe for GitDiffProbe {
    async fn capture(&self, task: &Task) -> Result<Option<Artifact>> {
        let diff = self.diff(&task.working_dir, task.base_commit.as_deref()).await?;
        let patch = if self.exclude_tests {
            remove_patches_to_tests(&diff)
        } else {
            diff
        };
        Ok((!patch.trim().is_empty()).then(|| Artifact::patch(patch)))
    }
}
