//! Retry policy with exponential backoff.
//!
//! [`RetryPolicy`] is the wire form distributed by the control plane;
//! [`Backoff`] tracks the attempts of one logical call and decides whether,
//! and after how long, the next attempt may start.

use crate::error::{FailureKind, PolicyError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Failure classes that may trigger a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    /// Upstream answered 5xx.
    ServerError,
    /// TCP connect or TLS handshake failed.
    ConnectFailure,
    /// The request was refused before the upstream processed it.
    RefusedStream,
    /// The attempt exceeded its timeout.
    Timeout,
}

impl RetryCondition {
    /// Returns true if a failure of `kind` falls under this condition.
    pub fn matches(self, kind: FailureKind) -> bool {
        matches!(
            (self, kind),
            (RetryCondition::ServerError, FailureKind::ServerError)
                | (RetryCondition::ConnectFailure, FailureKind::ConnectFailure)
                | (RetryCondition::RefusedStream, FailureKind::RefusedStream)
                | (RetryCondition::Timeout, FailureKind::Timeout)
        )
    }
}

/// Retry behavior of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total transport attempts, including the first one.
    pub max_attempts: u32,
    pub base_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// Upper bound of the additive jitter, as a fraction of the delay.
    pub jitter: f64,
    pub retry_on: Vec<RetryCondition>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval_ms: 100,
            multiplier: 2.0,
            max_interval_ms: 10_000,
            jitter: 0.2,
            retry_on: vec![
                RetryCondition::ServerError,
                RetryCondition::ConnectFailure,
                RetryCondition::RefusedStream,
                RetryCondition::Timeout,
            ],
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes a single attempt.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the total number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the maximum delay between attempts.
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the retry conditions.
    pub fn with_retry_on(mut self, conditions: Vec<RetryCondition>) -> Self {
        self.retry_on = conditions;
        self
    }

    /// Validates the policy.
    ///
    /// `multiplier >= 1 + jitter` keeps consecutive delays non-decreasing
    /// whatever the random jitter draws.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::Invalid(
                "retry_policy.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(PolicyError::Invalid(
                "retry_policy.jitter must be within [0, 1]".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 + self.jitter {
            return Err(PolicyError::Invalid(format!(
                "retry_policy.multiplier must be at least 1 + jitter ({})",
                1.0 + self.jitter
            )));
        }
        if self.base_interval_ms > self.max_interval_ms {
            return Err(PolicyError::Invalid(
                "retry_policy.base_interval_ms exceeds max_interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true if a failure of `kind` is retryable under this policy.
    pub fn retries_on(&self, kind: FailureKind) -> bool {
        self.retry_on.iter().any(|c| c.matches(kind))
    }

    /// Delay before retry `retry` (0 for the first retry), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let delay_ms = self.base_interval_ms as f64 * self.multiplier.powi(retry as i32);
        Duration::from_millis(delay_ms.min(self.max_interval_ms as f64) as u64)
    }

    /// Delay before retry `retry`, with additive jitter in
    /// `[0, jitter * delay)`, capped at `max_interval`.
    pub fn delay(&self, retry: u32) -> Duration {
        let delay_ms = self.base_interval_ms as f64 * self.multiplier.powi(retry as i32);
        let spread = self.jitter * delay_ms;
        let jittered = if spread > 0.0 && spread.is_finite() {
            delay_ms + rand::thread_rng().gen_range(0.0..spread)
        } else {
            delay_ms
        };
        Duration::from_millis(jittered.min(self.max_interval_ms as f64) as u64)
    }

    /// Starts tracking a new call.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Attempt bookkeeping for one logical call.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    last_delay: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Marks the start of a transport attempt.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Returns true if another attempt fits in the budget.
    pub fn has_remaining_attempts(&self) -> bool {
        self.attempts < self.policy.max_attempts.max(1)
    }

    /// Returns the delay before the next attempt, or `None` if the failure
    /// is not retryable or the attempt budget is exhausted.
    pub fn next_delay(&mut self, kind: FailureKind) -> Option<Duration> {
        if !self.has_remaining_attempts() || !self.policy.retries_on(kind) {
            return None;
        }

        let retry = self.attempts.saturating_sub(1);
        let delay = self.policy.delay(retry).max(self.last_delay);
        self.last_delay = delay;

        debug!(
            attempt = self.attempts,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_interval_ms, 100);
        assert!(policy.retries_on(FailureKind::Timeout));
        assert!(!policy.retries_on(FailureKind::Other));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_builder() {
        let policy = RetryPolicy::new()
            .with_max_attempts(5)
            .with_base_interval(Duration::from_millis(200))
            .with_jitter(0.0)
            .with_retry_on(vec![RetryCondition::ConnectFailure]);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_interval_ms, 200);
        assert!(policy.retries_on(FailureKind::ConnectFailure));
        assert!(!policy.retries_on(FailureKind::ServerError));
    }

    #[test]
    fn test_base_delay_increases_until_cap() {
        let policy = RetryPolicy::new()
            .with_base_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(500))
            .with_multiplier(2.0)
            .with_jitter(0.0);

        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new()
            .with_base_interval(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_jitter(0.5);

        for _ in 0..200 {
            let first = policy.delay(0);
            assert!(first >= Duration::from_millis(100));
            assert!(first < Duration::from_millis(150));

            let second = policy.delay(1);
            assert!(second >= Duration::from_millis(200));
            assert!(second < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_backoff_exhausts_after_max_attempts() {
        let mut backoff = RetryPolicy::new().with_max_attempts(3).backoff();

        backoff.record_attempt();
        assert!(backoff.next_delay(FailureKind::Timeout).is_some());
        backoff.record_attempt();
        assert!(backoff.next_delay(FailureKind::Timeout).is_some());
        backoff.record_attempt();
        assert!(backoff.next_delay(FailureKind::Timeout).is_none());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_backoff_does_not_retry_unlisted_failure() {
        let mut backoff = RetryPolicy::new()
            .with_retry_on(vec![RetryCondition::ServerError])
            .backoff();
        backoff.record_attempt();
        assert!(backoff.next_delay(FailureKind::Timeout).is_none());
        assert!(backoff.next_delay(FailureKind::ServerError).is_some());
    }

    #[test]
    fn test_backoff_delays_never_decrease() {
        let policy = RetryPolicy::new()
            .with_max_attempts(12)
            .with_base_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_millis(2_000))
            .with_multiplier(1.5)
            .with_jitter(0.5);
        assert!(policy.validate().is_ok());

        for _ in 0..50 {
            let mut backoff = policy.backoff();
            let mut previous = Duration::ZERO;
            backoff.record_attempt();
            while let Some(delay) = backoff.next_delay(FailureKind::ServerError) {
                assert!(delay >= previous);
                assert!(delay <= Duration::from_millis(2_000));
                previous = delay;
                backoff.record_attempt();
            }
            assert_eq!(backoff.attempts(), 12);
        }
    }

    #[test]
    fn test_validate_rejects_inconsistent_policy() {
        assert!(RetryPolicy::new().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::new()
            .with_multiplier(1.1)
            .with_jitter(0.5)
            .validate()
            .is_err());
        assert!(RetryPolicy::new()
            .with_base_interval(Duration::from_secs(20))
            .with_max_interval(Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_policy_json() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts":4,"base_interval_ms":50,"retry_on":["timeout","server_error"]}"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_interval_ms, 50);
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.retries_on(FailureKind::Timeout));
        assert!(!policy.retries_on(FailureKind::ConnectFailure));
    }
}
