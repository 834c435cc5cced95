//! Ensemble Selector Pipeline
//!
//! Prune the candidate set, split the survivors into fixed-size groups, run
//! selection trials for every group and reduce each group's votes to a
//! [`Verdict`]. Trials of all groups share one worker budget; a trial
//! whose environment or engine could not be set up is rerun up to
//! `max_retries` times.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use trail_core::{
    CancellationToken, LlmProvider, RunConfig, StepEngine, Task, Termination, ToolRegistry,
};

use crate::candidate::{Candidate, CandidateId};
use crate::config::EnsembleConfig;
use crate::error::{Result, SelectError};
use crate::prune::{prune, Pruning};
use crate::selector::{selected_id, selection_prompt, system_prompt, SelectTool, SelectionGate, SELECT_PATCH};
use crate::trial::{TrialEnvironment, TrialKey};

/// Candidates reviewed together by one selection run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub index: usize,
    pub candidates: Vec<Candidate>,
}

impl Group {
    pub fn ids(&self) -> Vec<CandidateId> {
        self.candidates.iter().map(|c| c.id).collect()
    }
}

/// Chunk candidates, in the order given, into groups of `size`
pub fn group(candidates: Vec<Candidate>, size: usize) -> Vec<Group> {
    let size = size.max(1);
    let mut groups: Vec<Group> = Vec::new();
    for candidate in candidates {
        match groups.last_mut() {
            Some(last) if last.candidates.len() < size => last.candidates.push(candidate),
            _ => groups.push(Group {
                index: groups.len(),
                candidates: vec![candidate],
            }),
        }
    }
    groups
}

/// How one selection trial ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub key: TrialKey,
    pub run_id: String,
    pub termination: Termination,
    /// `None` when the run ended without a valid selection
    pub vote: Option<CandidateId>,
}

/// Decision for one group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub group: usize,
    pub candidates: Vec<CandidateId>,
    pub selected: CandidateId,
    /// Votes per candidate, zero counts included
    pub tally: BTreeMap<CandidateId, u32>,
    /// No trial voted, or trials kept failing; `selected` is the lowest id
    /// in the group
    pub fallback: bool,
    pub trials: Vec<TrialRecord>,
    /// Last failure of a trial that never completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn tally(group: &Group, trials: &[TrialRecord]) -> BTreeMap<CandidateId, u32> {
    let mut tally: BTreeMap<CandidateId, u32> = group.candidates.iter().map(|c| (c.id, 0)).collect();
    for vote in trials.iter().filter_map(|t| t.vote) {
        if let Some(count) = tally.get_mut(&vote) {
            *count += 1;
        }
    }
    tally
}

impl Verdict {
    /// Highest count wins; ties go to the lowest id
    pub fn decide(group: &Group, trials: Vec<TrialRecord>) -> Self {
        let tally = tally(group, &trials);

        let mut best: Option<(CandidateId, u32)> = None;
        for (&id, &count) in &tally {
            if count > 0 && best.is_none_or(|(_, top)| count > top) {
                best = Some((id, count));
            }
        }

        let lowest = tally.keys().next().copied().unwrap_or_default();
        Self {
            group: group.index,
            candidates: group.ids(),
            selected: best.map_or(lowest, |(id, _)| id),
            fallback: best.is_none() && !trials.is_empty(),
            tally,
            trials,
            error: None,
        }
    }

    /// Some trial never completed; votes of the finished ones are kept in
    /// the tally but the group takes its lowest id
    pub fn abandoned(group: &Group, trials: Vec<TrialRecord>, error: String) -> Self {
        let tally = tally(group, &trials);
        Self {
            group: group.index,
            candidates: group.ids(),
            selected: tally.keys().next().copied().unwrap_or_default(),
            fallback: true,
            tally,
            trials,
            error: Some(error),
        }
    }
}

/// Result of a full selection pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOutcome {
    pub pruning: Pruning,
    pub verdicts: Vec<Verdict>,
    /// One winner per group, in group order
    pub winners: Vec<CandidateId>,
}

/// Drives selection trials over a candidate set
pub struct EnsemblePipeline {
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    environment: Arc<dyn TrialEnvironment>,
    config: EnsembleConfig,
    run_config: RunConfig,
    cancel: CancellationToken,
}

impl EnsemblePipeline {
    /// `tools` are what each selection agent may use besides `select_patch`
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        environment: Arc<dyn TrialEnvironment>,
    ) -> Self {
        Self {
            provider,
            tools,
            environment,
            config: EnsembleConfig::default(),
            run_config: RunConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EnsembleConfig) -> Self {
        self.config = config;
        self
    }

    /// Base settings of every selection run; the step budget, termination
    /// tool and prompt are overridden per group
    #[must_use]
    pub fn with_run_config(mut self, run_config: RunConfig) -> Self {
        self.run_config = run_config;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn select(&self, issue: &str, candidates: Vec<Candidate>) -> Result<SelectionOutcome> {
        self.config.validate()?;

        let (retained, pruning) = prune(candidates)?;
        if retained.is_empty() {
            tracing::warn!("no candidates left after pruning");
        }
        let groups = group(retained, self.config.group_size);
        let trials = self.config.trials_per_group();

        let jobs: Vec<(&Group, TrialKey)> = groups
            .iter()
            .filter(|g| g.candidates.len() > 1)
            .flat_map(|g| (0..trials).map(move |trial| (g, TrialKey { group: g.index, trial })))
            .collect();
        tracing::info!(
            groups = groups.len(),
            trials = jobs.len(),
            max_workers = self.config.max_workers,
            "starting selection"
        );

        let workers = if self.environment.shares_working_dir() {
            tracing::debug!("trials share one working directory, running them one at a time");
            1
        } else {
            self.config.max_workers
        };

        let mut pending = jobs;
        let mut records: Vec<TrialRecord> = Vec::new();
        let mut failures: BTreeMap<usize, String> = BTreeMap::new();
        for attempt in 0..=self.config.max_retries {
            if pending.is_empty() {
                break;
            }
            if attempt > 0 {
                tracing::warn!(attempt, trials = pending.len(), "rerunning failed trials");
            }

            let finished: Vec<_> = stream::iter(pending)
                .map(|(group, key)| async move { (group, key, self.run_trial(issue, group, key).await) })
                .buffer_unordered(workers)
                .collect()
                .await;

            if self.cancel.is_cancelled() {
                return Err(SelectError::Cancelled);
            }

            pending = Vec::new();
            for (group, key, result) in finished {
                match result {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        tracing::warn!(group = key.group, trial = key.trial, attempt, error = %err, "trial failed");
                        failures.insert(key.group, err.to_string());
                        pending.push((group, key));
                    }
                }
            }
        }

        let mut exhausted: BTreeMap<usize, String> = pending
            .iter()
            .filter_map(|(_, key)| failures.remove(&key.group).map(|error| (key.group, error)))
            .collect();

        let mut by_group: BTreeMap<usize, Vec<TrialRecord>> = BTreeMap::new();
        for record in records {
            by_group.entry(record.key.group).or_default().push(record);
        }

        let verdicts: Vec<Verdict> = groups
            .iter()
            .map(|g| {
                let mut trials = by_group.remove(&g.index).unwrap_or_default();
                trials.sort_by_key(|t| t.key);
                let verdict = match exhausted.remove(&g.index) {
                    Some(error) => {
                        tracing::error!(group = g.index, error = %error, "trials kept failing, falling back");
                        Verdict::abandoned(g, trials, error)
                    }
                    None => Verdict::decide(g, trials),
                };
                tracing::info!(
                    group = verdict.group,
                    selected = verdict.selected,
                    fallback = verdict.fallback,
                    tally = ?verdict.tally,
                    "group decided"
                );
                verdict
            })
            .collect();

        Ok(SelectionOutcome {
            pruning,
            winners: verdicts.iter().map(|v| v.selected).collect(),
            verdicts,
        })
    }

    async fn run_trial(&self, issue: &str, group: &Group, key: TrialKey) -> Result<TrialRecord> {
        let setup = self.environment.prepare(key).await?;

        let mut tools = self.tools.clone();
        tools.register(SelectTool);
        let config = self
            .run_config
            .clone()
            .with_max_steps(self.config.max_steps)
            .with_must_patch(false)
            .with_termination_tool(SELECT_PATCH)
            .with_system_prompt(system_prompt(group.candidates.len()));

        let built = StepEngine::builder()
            .provider(Arc::clone(&self.provider))
            .tools(tools)
            .gate(Arc::new(SelectionGate::new(group.ids())))
            .recorder(setup.recorder)
            .config(config)
            .cancellation(self.cancel.clone())
            .build();

        let run = match built {
            Ok(engine) => {
                let task = Task::new(selection_prompt(issue, &group.candidates), setup.working_dir);
                let span = tracing::info_span!("trial", group = key.group, trial = key.trial);
                Ok(engine.run(task).instrument(span).await)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = self.environment.release(key).await {
            tracing::warn!(group = key.group, trial = key.trial, error = %err, "trial cleanup failed");
        }
        let run = run?;

        let vote = run
            .artifact
            .as_ref()
            .filter(|_| run.termination == Termination::TaskDone)
            .and_then(selected_id);
        if vote.is_none() {
            tracing::warn!(
                group = key.group,
                trial = key.trial,
                termination = %run.termination,
                "trial ended without a selection"
            );
        }

        Ok(TrialRecord {
            key,
            run_id: run.run_id,
            termination: run.termination,
            vote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(ids: &[CandidateId]) -> Vec<Candidate> {
        ids.iter().map(|&id| Candidate::new(id, format!("patch {id}"))).collect()
    }

    fn record(group: usize, trial: u32, vote: Option<CandidateId>) -> TrialRecord {
        TrialRecord {
            key: TrialKey { group, trial },
            run_id: format!("run-{trial}"),
            termination: if vote.is_some() { Termination::TaskDone } else { Termination::MaxStepsExceeded },
            vote,
        }
    }

    #[test]
    fn test_grouping_chunks_in_order() {
        let groups = group(candidates(&[1, 2, 3, 4, 5]), 2);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].ids(), vec![1, 2]);
        assert_eq!(groups[2].ids(), vec![5]);
        assert_eq!(groups[2].index, 2);
    }

    #[test]
    fn test_majority_wins() {
        let g = &group(candidates(&[1, 2, 3]), 3)[0];
        let verdict = Verdict::decide(g, vec![record(0, 0, Some(2)), record(0, 1, Some(3)), record(0, 2, Some(2))]);
        assert_eq!(verdict.selected, 2);
        assert_eq!(verdict.tally, BTreeMap::from([(1, 0), (2, 2), (3, 1)]));
        assert!(!verdict.fallback);
    }

    #[test]
    fn test_tie_goes_to_lowest_id() {
        let g = &group(candidates(&[4, 7]), 2)[0];
        let verdict = Verdict::decide(g, vec![record(0, 0, Some(7)), record(0, 1, Some(4))]);
        assert_eq!(verdict.selected, 4);
    }

    #[test]
    fn test_no_votes_falls_back_to_lowest_id() {
        let g = &group(candidates(&[6, 9]), 2)[0];
        let verdict = Verdict::decide(g, vec![record(0, 0, None), record(0, 1, None)]);
        assert_eq!(verdict.selected, 6);
        assert!(verdict.fallback);
    }

    #[test]
    fn test_abandoned_group_takes_lowest_id() {
        let g = &group(candidates(&[8, 2]), 2)[0];
        let verdict = Verdict::abandoned(g, vec![record(0, 0, Some(8))], "checkout failed".into());
        assert_eq!(verdict.selected, 2);
        assert!(verdict.fallback);
        assert_eq!(verdict.tally, BTreeMap::from([(2, 0), (8, 1)]));
        assert_eq!(verdict.error.as_deref(), Some("checkout failed"));
    }

    #[test]
    fn test_single_candidate_needs_no_trials() {
        let g = &group(candidates(&[3]), 10)[0];
        let verdict = Verdict::decide(g, Vec::new());
        assert_eq!(verdict.selected, 3);
        assert_eq!(verdict.tally, BTreeMap::from([(3, 0)]));
        assert!(!verdict.fallback);
    }
}
