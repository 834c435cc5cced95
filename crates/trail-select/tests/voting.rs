//! Selection pipeline end to end with a scripted reviewer model.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use trail_core::trajectory;
use trail_core::{
    CancellationToken, Completion, GenerationOptions, LlmProvider, Message, NullTrajectory, Role, Termination,
    TokenUsage, ToolCall, ToolRegistry, ToolSchema,
};
use trail_select::{
    Candidate, CandidateId, EnsembleConfig, EnsemblePipeline, SelectError, SharedCheckout, TrajectoryDir,
    TrialEnvironment, TrialKey, TrialSetup, SELECT_PATCH,
};

// ============================================================================
// Fixtures
// ============================================================================

/// Answers each trial with the next scripted pick for its group
///
/// The group is recognised by its first candidate's id in the prompt. When a
/// group's script has one pick left it is repeated.
struct Reviewer {
    picks: Mutex<HashMap<CandidateId, VecDeque<Value>>>,
    calls: AtomicU32,
}

impl Reviewer {
    fn new(script: impl IntoIterator<Item = (CandidateId, Vec<Value>)>) -> Arc<Self> {
        Arc::new(Self {
            picks: Mutex::new(script.into_iter().map(|(id, picks)| (id, picks.into())).collect()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for Reviewer {
    fn name(&self) -> &str {
        "reviewer"
    }

    async fn health_check(&self) -> trail_core::Result<bool> {
        Ok(true)
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> trail_core::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(tools.iter().any(|t| t.name == SELECT_PATCH));

        let prompt = &messages.iter().find(|m| m.role == Role::User).unwrap().content;
        let mut picks = self.picks.lock().unwrap();
        let script = picks
            .iter_mut()
            .find(|(id, _)| prompt.contains(&format!("Candidate {id}:")))
            .map(|(_, script)| script)
            .expect("prompt names no scripted group");
        let pick = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        };

        let call = ToolCall::from_json(ToolCall::fresh_id(), SELECT_PATCH, json!({ "candidate_id": pick }));
        Ok(Completion {
            message: Message::assistant_with_calls("Reviewed all candidates.", vec![call]),
            model: options.model.clone(),
            usage: Some(TokenUsage::new(50, 10)),
            finish_reason: None,
        })
    }
}

/// Fails the first `failures` setups, then hands out one directory per trial
#[derive(Default)]
struct FlakyCheckout {
    failures: u32,
    prepared: AtomicU32,
}

impl FlakyCheckout {
    fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            ..Self::default()
        })
    }

    fn prepared(&self) -> u32 {
        self.prepared.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrialEnvironment for FlakyCheckout {
    async fn prepare(&self, key: TrialKey) -> trail_select::Result<TrialSetup> {
        if self.prepared.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(SelectError::Environment(format!("no checkout for group {}", key.group)));
        }
        Ok(TrialSetup {
            working_dir: PathBuf::from(format!("/checkouts/{}-{}", key.group, key.trial)),
            recorder: Arc::new(NullTrajectory),
        })
    }
}

/// Counts trials holding a working directory at the same time
struct Occupancy {
    shared: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    dirs: Mutex<BTreeSet<PathBuf>>,
}

impl Occupancy {
    fn new(shared: bool) -> Arc<Self> {
        Arc::new(Self {
            shared,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            dirs: Mutex::new(BTreeSet::new()),
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrialEnvironment for Occupancy {
    async fn prepare(&self, key: TrialKey) -> trail_select::Result<TrialSetup> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let working_dir = if self.shared {
            PathBuf::from("/repo")
        } else {
            PathBuf::from(format!("/checkouts/{}-{}", key.group, key.trial))
        };
        self.dirs.lock().unwrap().insert(working_dir.clone());
        Ok(TrialSetup {
            working_dir,
            recorder: Arc::new(NullTrajectory),
        })
    }

    async fn release(&self, _key: TrialKey) -> trail_select::Result<()> {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn shares_working_dir(&self) -> bool {
        self.shared
    }
}

fn patch(value: u32) -> String {
    format!("diff --git a/calc.py b/calc.py\n--- a/calc.py\n+++ b/calc.py\n@@ -1 +1 @@\n-x = 0\n+x = {value}\n")
}

fn candidates(ids: &[CandidateId]) -> Vec<Candidate> {
    ids.iter().map(|&id| Candidate::new(id, patch(id))).collect()
}

fn pipeline(reviewer: Arc<Reviewer>, config: EnsembleConfig) -> EnsemblePipeline {
    EnsemblePipeline::new(reviewer, ToolRegistry::new(), Arc::new(SharedCheckout::new("/repo"))).with_config(config)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_majority_vote_per_group() {
    let reviewer = Reviewer::new([
        (1, vec![json!(1), json!(2), json!(1)]),
        (3, vec![json!(4), json!("Candidate 3"), json!(4)]),
    ]);
    let config = EnsembleConfig::default().with_group_size(2).with_trials(3);

    let outcome = pipeline(Arc::clone(&reviewer), config)
        .select("Adding two numbers returns the wrong result", candidates(&[1, 2, 3, 4]))
        .await
        .unwrap();

    assert_eq!(outcome.winners, vec![1, 4]);
    assert_eq!(outcome.verdicts[0].tally, BTreeMap::from([(1, 2), (2, 1)]));
    assert_eq!(outcome.verdicts[1].tally, BTreeMap::from([(3, 1), (4, 2)]));
    assert!(outcome.verdicts.iter().all(|v| v.trials.len() == 3 && !v.fallback));
    assert_eq!(reviewer.calls(), 6);
}

#[tokio::test]
async fn test_out_of_group_picks_cast_no_vote() {
    let reviewer = Reviewer::new([(5, vec![json!(99)])]);
    let config = EnsembleConfig::default().with_trials(2).with_max_steps(2);

    let outcome = pipeline(Arc::clone(&reviewer), config)
        .select("issue", candidates(&[7, 5]))
        .await
        .unwrap();

    let verdict = &outcome.verdicts[0];
    assert!(verdict.fallback);
    assert_eq!(verdict.selected, 5);
    assert!(verdict.trials.iter().all(|t| t.vote.is_none()));
    assert!(verdict.trials.iter().all(|t| t.termination == Termination::MaxStepsExceeded));
    assert_eq!(reviewer.calls(), 4);
}

#[tokio::test]
async fn test_rejected_pick_can_be_corrected() {
    let reviewer = Reviewer::new([(1, vec![json!(3), json!(2)])]);
    let config = EnsembleConfig::default().with_majority_voting(false);

    let outcome = pipeline(reviewer, config).select("issue", candidates(&[1, 2])).await.unwrap();
    assert_eq!(outcome.winners, vec![2]);
    assert_eq!(outcome.verdicts[0].trials.len(), 1);
}

#[tokio::test]
async fn test_pruned_to_one_candidate_runs_no_agent() {
    let reviewer = Reviewer::new(Vec::<(CandidateId, Vec<Value>)>::new());
    let mut set = candidates(&[1, 2]);
    set[0].regressions.push("test_add".into());
    set.push(Candidate::new(3, patch(2).replace("x = 2", "x =   2  # same fix")));

    let outcome = pipeline(Arc::clone(&reviewer), EnsembleConfig::default())
        .select("issue", set)
        .await
        .unwrap();

    assert_eq!(outcome.winners, vec![2]);
    assert_eq!(outcome.pruning.regressed, vec![1]);
    assert_eq!(outcome.pruning.duplicates.get(&3), Some(&2));
    assert!(outcome.verdicts[0].trials.is_empty());
    assert_eq!(reviewer.calls(), 0);
}

#[tokio::test]
async fn test_every_trial_gets_its_own_trajectory() {
    let dir = tempfile::tempdir().unwrap();
    let reviewer = Reviewer::new([(1, vec![json!(2)])]);
    let env = TrajectoryDir::new("/repo", dir.path());

    let outcome = EnsemblePipeline::new(reviewer, ToolRegistry::new(), Arc::new(env.clone()))
        .with_config(EnsembleConfig::default().with_trials(3))
        .select("issue", candidates(&[1, 2]))
        .await
        .unwrap();
    assert_eq!(outcome.winners, vec![2]);

    for trial in 0..3 {
        let path = env.path_for(TrialKey { group: 0, trial });
        let recorded = trajectory::load_trajectory(&path).unwrap();
        assert_eq!(recorded.steps.len(), 1);
        assert_eq!(recorded.steps[0].tool_calls[0].name, SELECT_PATCH);
        assert_eq!(recorded.summary.unwrap().termination, Termination::TaskDone);
    }
}

#[tokio::test]
async fn test_failed_setup_is_retried() {
    let reviewer = Reviewer::new([(1, vec![json!(2)])]);
    let env = FlakyCheckout::failing(1);
    let config = EnsembleConfig::default().with_trials(1).with_max_retries(1);

    let outcome = EnsemblePipeline::new(Arc::<Reviewer>::clone(&reviewer), ToolRegistry::new(), env.clone())
        .with_config(config)
        .select("issue", candidates(&[1, 2]))
        .await
        .unwrap();

    let verdict = &outcome.verdicts[0];
    assert_eq!(verdict.selected, 2);
    assert!(!verdict.fallback);
    assert!(verdict.error.is_none());
    assert_eq!(verdict.trials.len(), 1);
    assert_eq!(env.prepared(), 2);
    assert_eq!(reviewer.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fall_back_per_group() {
    let reviewer = Reviewer::new([(1, vec![json!(2)]), (3, vec![json!(4)])]);
    // One worker: group 0's three trials are set up first and all fail
    let env = FlakyCheckout::failing(3);
    let config = EnsembleConfig::default()
        .with_group_size(2)
        .with_trials(3)
        .with_max_workers(1)
        .with_max_retries(0);

    let outcome = EnsemblePipeline::new(Arc::<Reviewer>::clone(&reviewer), ToolRegistry::new(), env.clone())
        .with_config(config)
        .select("issue", candidates(&[1, 2, 3, 4]))
        .await
        .unwrap();

    let first = &outcome.verdicts[0];
    assert_eq!(first.selected, 1);
    assert!(first.fallback);
    assert!(first.trials.is_empty());
    assert!(first.error.as_deref().unwrap().contains("no checkout for group 0"));

    let second = &outcome.verdicts[1];
    assert_eq!(second.selected, 4);
    assert!(second.error.is_none());
    assert_eq!(outcome.winners, vec![1, 4]);
    assert_eq!(env.prepared(), 6);
}

#[tokio::test]
async fn test_isolated_trials_run_concurrently_in_separate_dirs() {
    let reviewer = Reviewer::new([(1, vec![json!(1)])]);
    let env = Occupancy::new(false);

    EnsemblePipeline::new(reviewer, ToolRegistry::new(), env.clone())
        .with_config(EnsembleConfig::default().with_trials(4).with_max_workers(4))
        .select("issue", candidates(&[1, 2]))
        .await
        .unwrap();

    assert!(env.peak() > 1);
    assert_eq!(env.dirs.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_shared_checkout_runs_one_trial_at_a_time() {
    let reviewer = Reviewer::new([(1, vec![json!(1)])]);
    let env = Occupancy::new(true);

    let outcome = EnsemblePipeline::new(reviewer, ToolRegistry::new(), env.clone())
        .with_config(EnsembleConfig::default().with_trials(4).with_max_workers(4))
        .select("issue", candidates(&[1, 2]))
        .await
        .unwrap();

    assert_eq!(outcome.verdicts[0].trials.len(), 4);
    assert_eq!(env.peak(), 1);
}

#[tokio::test]
async fn test_cancelled_selection_reports_cancellation() {
    let reviewer = Reviewer::new([(1, vec![json!(1)])]);
    let token = CancellationToken::new();
    token.cancel();

    let err = pipeline(Arc::clone(&reviewer), EnsembleConfig::default())
        .with_cancellation(token)
        .select("issue", candidates(&[1, 2]))
        .await
        .unwrap_err();
    assert!(matches!(err, SelectError::Cancelled));
    assert_eq!(reviewer.calls(), 0);
}
