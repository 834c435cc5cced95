//! Retry/Backoff Controller
//!
//! Wraps one fallible operation with a bounded retry policy. Only failures the
//! classifier accepts are retried; anything else is returned as-is. When the
//! budget runs out the caller gets [`AgentError::RetryExhausted`] carrying the
//! last failure.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Predicate separating transient from fatal failures
pub type Classifier = fn(&AgentError) -> bool;

/// Delay schedule between attempts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor per retry
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Randomise each delay within [delay/2, delay]
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

const fn default_initial_delay_ms() -> u64 { 3_000 }
const fn default_max_delay_ms() -> u64 { 30_000 }
const fn default_multiplier() -> f64 { 2.0 }
const fn default_jitter() -> bool { true }

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl Backoff {
    /// No waiting between attempts
    pub const fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (0-based)
    ///
    /// `initial * multiplier^retry`, capped at `max_delay_ms`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = (self.initial_delay_ms as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay_ms as f64) as u64;

        let millis = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

/// Bounded retry policy
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,

    /// Delay schedule
    pub backoff: Backoff,

    /// Which failures are worth another attempt
    pub retryable: Classifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            retryable: AgentError::is_retryable,
        }
    }

    /// Retries without delay (tests, local backends)
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Backoff::immediate())
    }

    /// Single attempt, never retried
    pub fn none() -> Self {
        Self::immediate(0)
    }

    #[must_use]
    pub fn with_classifier(mut self, retryable: Classifier) -> Self {
        self.retryable = retryable;
        self
    }

    /// Total attempts this policy allows
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Run `operation` under `policy`
///
/// The closure receives the 0-based attempt number. Non-retryable failures are
/// returned unchanged after the attempt that produced them.
pub async fn attempt<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt_no = 0;

    loop {
        let err = match operation(attempt_no).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !(policy.retryable)(&err) {
            return Err(err);
        }

        if attempt_no >= policy.max_retries {
            tracing::warn!(attempts = attempt_no + 1, error = %err, "retry budget exhausted");
            return Err(AgentError::RetryExhausted {
                attempts: attempt_no + 1,
                last: Box::new(err),
            });
        }

        let delay = policy.backoff.delay(attempt_no);
        tracing::warn!(
            attempt = attempt_no + 1,
            max_attempts = policy.max_attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "transient failure, retrying after backoff"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt_no += 1;
    }
}
