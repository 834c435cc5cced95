//! # trail-select
//!
//! Picks one candidate solution per group out of an ensemble of patches.
//!
//! ```text
//! candidates ──▶ prune ──▶ group ──▶ trials (StepEngine × N) ──▶ vote ──▶ winners
//!                 │                        │
//!          empty / regressed /     select_patch gated to
//!             duplicates            the group's ids
//! ```
//!
//! Candidate generation happens elsewhere; this crate only narrows a
//! fixed set down. Reducing the per-group winners further is left to the
//! caller.

pub mod candidate;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod prune;
pub mod selector;
pub mod trial;

pub use candidate::{clean_patch, Candidate, CandidateId};
pub use config::EnsembleConfig;
pub use error::{Result, SelectError};
pub use pipeline::{group, EnsemblePipeline, Group, SelectionOutcome, TrialRecord, Verdict};
pub use prune::{prune, Pruning};
pub use selector::{SelectTool, SelectionGate, SELECT_PATCH};
pub use trial::{trajectory_path, GitWorktrees, SharedCheckout, TrajectoryDir, TrialEnvironment, TrialKey, TrialSetup};
