//! Ensemble Configuration

use serde::{Deserialize, Serialize};

use crate::error::{Result, SelectError};

/// Settings for one selection pass over a candidate set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Candidates per selection group
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    /// Run several independent trials per group and take the majority
    #[serde(default = "default_majority_voting")]
    pub majority_voting: bool,

    /// Trials per group when voting
    #[serde(default = "default_trials")]
    pub trials: u32,

    /// Selection runs in flight at once, across all groups
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Step budget of each selection run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Reruns of a trial that failed to set up or start; once spent, its
    /// group falls back to its lowest id
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

const fn default_group_size() -> usize { 10 }
const fn default_majority_voting() -> bool { true }
const fn default_trials() -> u32 { 3 }
const fn default_max_workers() -> usize { 4 }
const fn default_max_steps() -> u32 { 50 }
const fn default_max_retries() -> u32 { 2 }

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            majority_voting: default_majority_voting(),
            trials: default_trials(),
            max_workers: default_max_workers(),
            max_steps: default_max_steps(),
            max_retries: default_max_retries(),
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(SelectError::Config("group_size must be at least 1".into()));
        }
        if self.majority_voting && self.trials == 0 {
            return Err(SelectError::Config("trials must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(SelectError::Config("max_workers must be at least 1".into()));
        }
        if self.max_steps == 0 {
            return Err(SelectError::Config("max_steps must be at least 1".into()));
        }
        Ok(())
    }

    /// Selection runs per group
    pub const fn trials_per_group(&self) -> u32 {
        if self.majority_voting { self.trials } else { 1 }
    }

    #[must_use]
    pub const fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    #[must_use]
    pub const fn with_majority_voting(mut self, enabled: bool) -> Self {
        self.majority_voting = enabled;
        self
    }

    #[must_use]
    pub const fn with_trials(mut self, trials: u32) -> Self {
        self.trials = trials;
        self
    }

    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    #[must_use]
    pub const fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EnsembleConfig::default();
        assert_eq!(config.group_size, 10);
        assert!(config.majority_voting);
        assert_eq!(config.trials_per_group(), 3);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.max_retries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_trial_without_voting() {
        let config = EnsembleConfig::default().with_majority_voting(false).with_trials(7);
        assert_eq!(config.trials_per_group(), 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EnsembleConfig =
            serde_json::from_value(serde_json::json!({"group_size": 2, "trials": 5})).unwrap();
        assert_eq!(config.group_size, 2);
        assert_eq!(config.trials, 5);
        assert_eq!(config.max_steps, 50);
    }

    #[test]
    fn test_validate() {
        assert!(EnsembleConfig::default().with_group_size(0).validate().is_err());
        assert!(EnsembleConfig::default().with_max_workers(0).validate().is_err());
        assert!(EnsembleConfig::default().with_trials(0).validate().is_err());
        assert!(EnsembleConfig::default()
            .with_trials(0)
            .with_majority_voting(false)
            .validate()
            .is_ok());
    }
}
