//! Retry policy with exponential backoff and jitter.
//!
//! The policy decides, from an error's classification and the attempts
//! already burned, whether a fetch is retried, demoted to an item
//! failure, skipped, or escalated into a run abort.

use crate::errors::{ConfigError, ErrorClass};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior, applied per chunk execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied per additional attempt.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Cap on the computed delay, in milliseconds (before jitter).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive transient failures after which the item fails terminally.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Whether to add random jitter to computed delays.
    #[serde(default = "default_jitter_enabled")]
    pub jitter_enabled: bool,
    /// Upper bound of the jitter as a fraction of the computed delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_jitter_enabled() -> bool {
    true
}

fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_enabled: default_jitter_enabled(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the backoff factor.
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Sets the jitter ratio.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Validates the policy parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::new("max_attempts", "must be >= 1"));
        }
        if self.factor < 1.0 {
            return Err(ConfigError::new("factor", "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::new("jitter_ratio", "must be in [0, 1]"));
        }
        Ok(())
    }

    /// Computes the backoff delay for a retry.
    ///
    /// `attempt` is 1-based: the delay before the first retry uses
    /// `attempt == 1` and equals the base delay. The exponential curve is
    /// capped at `max_delay_ms`, then a uniform random jitter in
    /// `[0, jitter_ratio * delay]` is added when jitter is enabled.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = self.base_delay_ms as f64 * self.factor.powi(exponent as i32);
        let capped = raw.min(self.max_delay_ms as f64);

        let jittered = if self.jitter_enabled && self.jitter_ratio > 0.0 {
            let span = capped * self.jitter_ratio;
            capped + rand::thread_rng().gen_range(0.0..=span)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }

    /// Decides what to do about a classified failure.
    ///
    /// Records the failure on `state`, then:
    /// - Transient with attempts remaining yields `Retry(delay)`;
    /// - Transient with the budget exhausted yields `GiveUp` (the item is
    ///   demoted to a terminal failure);
    /// - Permanent yields `NotRetryable`;
    /// - Fatal yields `Abort`.
    #[must_use]
    pub fn decide(&self, state: &mut RetryState, class: ErrorClass) -> RetryDecision {
        state.record_failure(class);

        match class {
            ErrorClass::Transient => {
                if state.attempt() < self.max_attempts {
                    RetryDecision::Retry(self.next_delay(state.attempt()))
                } else {
                    RetryDecision::GiveUp
                }
            }
            ErrorClass::Permanent => RetryDecision::NotRetryable,
            ErrorClass::Fatal => RetryDecision::Abort,
        }
    }
}

/// Per-item retry state, owned by one chunk execution and discarded once
/// the item reaches a terminal outcome.
#[derive(Debug, Default)]
pub struct RetryState {
    attempt: u32,
    last_class: Option<ErrorClass>,
}

impl RetryState {
    /// Creates a fresh state with no recorded failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failed attempt.
    pub fn record_failure(&mut self, class: ErrorClass) {
        self.attempt += 1;
        self.last_class = Some(class);
    }

    /// Returns the number of failed attempts recorded so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the classification of the most recent failure.
    #[must_use]
    pub fn last_class(&self) -> Option<ErrorClass> {
        self.last_class
    }

    /// Returns true once the transient budget is spent.
    #[must_use]
    pub fn exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempt >= policy.max_attempts
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry(Duration),
    /// Transient budget exhausted; fail the item terminally.
    GiveUp,
    /// The error is permanent; fail the item without retrying.
    NotRetryable,
    /// The error is fatal; abort the whole run.
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new().with_jitter(false)
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms, 1000);
        assert!((policy.factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.jitter_enabled);
        assert!((policy.jitter_ratio - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_policy_builder() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(250)
            .with_factor(3.0)
            .with_max_delay_ms(10_000)
            .with_max_attempts(7)
            .with_jitter(false);

        assert_eq!(policy.base_delay_ms, 250);
        assert!((policy.factor - 3.0).abs() < f64::EPSILON);
        assert_eq!(policy.max_attempts, 7);
        assert!(!policy.jitter_enabled);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::new().with_factor(0.5).validate().is_err());
        assert!(RetryPolicy::new().with_jitter_ratio(1.5).validate().is_err());
    }

    #[test]
    fn test_delay_exponential_progression() {
        let policy = no_jitter().with_base_delay_ms(100);

        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(400));
        assert_eq!(policy.next_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped() {
        let policy = no_jitter().with_base_delay_ms(1000).with_max_delay_ms(5000);

        assert_eq!(policy.next_delay(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_delay_monotonic_without_jitter() {
        let policy = no_jitter().with_base_delay_ms(50);

        let mut previous = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            previous = delay;
        }
    }

    #[test]
    fn test_delay_jitter_bounds() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_jitter(true)
            .with_jitter_ratio(0.2);

        for _ in 0..50 {
            let delay = policy.next_delay(1).as_millis() as u64;
            assert!((100..=120).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_decide_transient_until_exhausted() {
        let policy = no_jitter().with_max_attempts(3);
        let mut state = RetryState::new();

        assert!(matches!(
            policy.decide(&mut state, ErrorClass::Transient),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            policy.decide(&mut state, ErrorClass::Transient),
            RetryDecision::Retry(_)
        ));
        // Third consecutive transient failure spends the budget.
        assert_eq!(
            policy.decide(&mut state, ErrorClass::Transient),
            RetryDecision::GiveUp
        );
        assert!(state.exhausted(&policy));
    }

    #[test]
    fn test_decide_permanent_immediately_fails() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();

        assert_eq!(
            policy.decide(&mut state, ErrorClass::Permanent),
            RetryDecision::NotRetryable
        );
        assert_eq!(state.attempt(), 1);
        assert_eq!(state.last_class(), Some(ErrorClass::Permanent));
    }

    #[test]
    fn test_decide_fatal_aborts() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();

        assert_eq!(
            policy.decide(&mut state, ErrorClass::Fatal),
            RetryDecision::Abort
        );
    }

    #[test]
    fn test_retry_delays_use_attempt_number() {
        let policy = no_jitter().with_base_delay_ms(100).with_max_attempts(4);
        let mut state = RetryState::new();

        let first = policy.decide(&mut state, ErrorClass::Transient);
        let second = policy.decide(&mut state, ErrorClass::Transient);

        assert_eq!(first, RetryDecision::Retry(Duration::from_millis(100)));
        assert_eq!(second, RetryDecision::Retry(Duration::from_millis(200)));
    }
}
