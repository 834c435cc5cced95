//! Candidate solutions and patch normalisation

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectError};

pub type CandidateId = u32;

/// One proposed solution to the issue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,

    /// Unified diff
    pub patch: String,

    /// Names of regression tests this patch breaks
    #[serde(default)]
    pub regressions: Vec<String>,

    /// Ground-truth label, when known; only carried through for reporting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<bool>,
}

impl Candidate {
    pub fn new(id: CandidateId, patch: impl Into<String>) -> Self {
        Self {
            id,
            patch: patch.into(),
            regressions: Vec::new(),
            resolved: None,
        }
    }

    #[must_use]
    pub fn with_regressions(mut self, tests: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.regressions = tests.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_patch(&self) -> bool {
        !self.patch.trim().is_empty()
    }

    pub fn passes_regressions(&self) -> bool {
        self.regressions.is_empty()
    }

    /// Normalised form used to detect semantic duplicates
    pub fn fingerprint(&self) -> String {
        clean_patch(&self.patch)
    }
}

/// Read candidates from a JSON Lines file, one candidate per line
pub fn load(path: impl AsRef<Path>) -> Result<Vec<Candidate>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Candidate>(line).map_err(SelectError::from))
        .collect()
}

/// Reduce a diff to its changed code
///
/// Keeps only added and removed hunk lines, drops blank and comment-only
/// lines, strips trailing `#` comments and removes all whitespace. Two
/// patches that differ only in formatting or comments normalise equal.
pub fn clean_patch(patch: &str) -> String {
    let mut extracted = Vec::new();
    let mut in_hunk = false;

    for line in patch.lines() {
        if line.starts_with("diff ") {
            in_hunk = false;
            continue;
        }
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            continue;
        }

        let (sign, body) = match line.as_bytes().first() {
            Some(b'+') => ('+', line.trim_start_matches('+')),
            Some(b'-') => ('-', line.trim_start_matches('-')),
            _ => continue,
        };
        if body.trim().is_empty() || body.trim_start().starts_with('#') {
            continue;
        }
        extracted.push(format!("{sign}{}", strip_comment(body.trim_end())));
    }

    extracted.join("\n").split_whitespace().collect()
}

/// Cut a trailing `#` comment that is not inside a string literal
fn strip_comment(line: &str) -> &str {
    let mut quote = None;
    let mut escaped = false;

    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (c, quote) {
            ('\\', Some(_)) => escaped = true,
            ('"' | '\'', None) => quote = Some(c),
            (c, Some(q)) if c == q => quote = None,
            ('#', None) => return line[..i].trim_end(),
            _ => {}
        }
    }
    line
}
