//! Candidate pruning
//!
//! Runs before any selection agent: drops empty patches, eliminates
//! candidates that break regression tests, then collapses semantic
//! duplicates onto the lowest id.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, CandidateId};
use crate::error::{Result, SelectError};

/// What pruning removed and why
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pruning {
    /// Candidates without a patch
    pub empty: Vec<CandidateId>,

    /// Candidates eliminated for failing regression tests
    pub regressed: Vec<CandidateId>,

    /// Every candidate failed regressions, so the signal was ignored
    pub regression_signal_ignored: bool,

    /// Dropped duplicate id -> retained id with the same normalised patch
    pub duplicates: BTreeMap<CandidateId, CandidateId>,

    /// Survivors, in id order
    pub retained: Vec<CandidateId>,
}

/// Partition candidates; the returned candidates are sorted by id
pub fn prune(mut candidates: Vec<Candidate>) -> Result<(Vec<Candidate>, Pruning)> {
    candidates.sort_by_key(|c| c.id);
    if let Some(pair) = candidates.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(SelectError::DuplicateCandidate(pair[0].id));
    }

    let mut report = Pruning::default();

    let (candidates, empty): (Vec<_>, Vec<_>) = candidates.into_iter().partition(Candidate::has_patch);
    report.empty = empty.iter().map(|c| c.id).collect();

    let (passing, failing): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(Candidate::passes_regressions);
    let candidates = if passing.is_empty() && !failing.is_empty() {
        tracing::warn!(
            candidates = failing.len(),
            "every candidate fails regression tests, keeping all"
        );
        report.regression_signal_ignored = true;
        failing
    } else {
        report.regressed = failing.iter().map(|c| c.id).collect();
        passing
    };

    let mut seen: HashMap<String, CandidateId> = HashMap::new();
    let mut retained = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match seen.entry(candidate.fingerprint()) {
            Entry::Occupied(kept) => {
                report.duplicates.insert(candidate.id, *kept.get());
            }
            Entry::Vacant(slot) => {
                slot.insert(candidate.id);
                retained.push(candidate);
            }
        }
    }
    report.retained = retained.iter().map(|c| c.id).collect();

    tracing::info!(
        retained = report.retained.len(),
        empty = report.empty.len(),
        regressed = report.regressed.len(),
        duplicates = report.duplicates.len(),
        "candidates pruned"
    );
    Ok((retained, report))
}
