//! Selection runs
//!
//! A selection run is an ordinary step-engine run whose termination tool is
//! `select_patch`. The [`SelectionGate`] only accepts ids from the group
//! under review; anything else goes back to the model as a failed result.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use async_trait::async_trait;
use trail_core::{
    Artifact, ArtifactKind, GateDecision, ParameterSchema, Result, RunConfig, Task, TerminationGate,
    Tool, ToolCall, ToolContext, ToolResult, ToolSchema,
};

use crate::candidate::{Candidate, CandidateId};

/// Termination tool of selection runs
pub const SELECT_PATCH: &str = "select_patch";

/// Evaluator role prompt for a group of `count` candidates
pub fn system_prompt(count: usize) -> String {
    format!(
        r"You are an expert code reviewer. You are given a code repository, an issue and {count} candidate patches written by other engineers. Exactly one of them must be chosen as the fix for the issue.

Work through these steps:
1. Read the issue and the code it refers to, including the original code each patch modifies and anything that interacts with it.
2. Analyse the logic of every candidate and whether it addresses the issue without breaking related behaviour.
3. If it helps, write and run small tests against the repository to check a candidate. Restore the repository afterwards.
4. Choose the candidate that resolves the issue with the least risk.

Rules:
- Always make a selection; at least one candidate is correct.
- Do not write a new patch of your own.
- Finish by calling `{SELECT_PATCH}` with the id of the chosen candidate and a short analysis."
    )
}

/// Issue text followed by every candidate of the group
pub fn selection_prompt(issue: &str, group: &[Candidate]) -> String {
    let mut prompt = format!("{issue}\n\n[Candidate Patches]:");
    for candidate in group {
        let _ = write!(prompt, "\nCandidate {}:\n```\n{}\n```", candidate.id, candidate.patch.trim_end());
    }
    prompt
}

/// `select_patch`; intercepted by the engine's gate
#[derive(Clone, Debug, Default)]
pub struct SelectTool;

#[async_trait]
impl Tool for SelectTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: SELECT_PATCH.into(),
            description: "Submit your final choice. Ends the review.".into(),
            parameters: vec![
                ParameterSchema::required("candidate_id", "integer", "Id of the chosen candidate"),
                ParameterSchema::optional("analysis", "string", "Why this candidate is correct"),
            ],
        }
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<ToolResult> {
        Ok(ToolResult::success(SELECT_PATCH, &call.id, "Selection recorded."))
    }
}

/// Candidate id named by a `select_patch` call
///
/// Accepts a JSON integer or a string ending in digits, such as `"3"` or
/// `"Candidate 3"`.
pub fn parse_selection(call: &ToolCall) -> Option<CandidateId> {
    let value = call.arguments.get("candidate_id")?;
    if let Some(id) = value.as_u64() {
        return CandidateId::try_from(id).ok();
    }
    let text = value.as_str()?.trim();
    let digits = text.len() - text.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    text[text.len() - digits..].parse().ok()
}

/// Read the chosen id back from a run's artifact
pub fn selected_id(artifact: &Artifact) -> Option<CandidateId> {
    (artifact.kind == ArtifactKind::Selection)
        .then(|| artifact.content.trim().parse().ok())
        .flatten()
}

/// Accepts `select_patch` only for members of the group
pub struct SelectionGate {
    group: BTreeSet<CandidateId>,
}

impl SelectionGate {
    pub fn new(group: impl IntoIterator<Item = CandidateId>) -> Self {
        Self {
            group: group.into_iter().collect(),
        }
    }

    fn choices(&self) -> String {
        self.group.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    }
}

#[async_trait]
impl TerminationGate for SelectionGate {
    async fn evaluate(&self, call: &ToolCall, _task: &Task, _config: &RunConfig) -> Result<GateDecision> {
        let decision = match parse_selection(call) {
            Some(id) if self.group.contains(&id) => GateDecision::Accept(Some(Artifact::selection(id.to_string()))),
            Some(id) => GateDecision::Reject(format!(
                "Candidate {id} is not under review. Choose one of: {}",
                self.choices()
            )),
            None => GateDecision::Reject(format!(
                "`candidate_id` must name one of: {}",
                self.choices()
            )),
        };
        Ok(decision)
    }
}
