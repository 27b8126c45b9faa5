//! Retry eligibility and delay for classified failures.
//!
//! The schedule is a pure function of the error kind and the attempt number, so it can be
//! checked without touching a clock: `delay(n) = initial * multiplier^(n - 1)`, capped at the
//! configured maximum. Only [`ErrorKind::is_retryable`] kinds are retried, and at most
//! `max_attempts` times in a row.

use std::time::Duration;

use config::shared::BackoffConfig;

use crate::error::{ErrorKind, EtlError};

/// Outcome of [`BackoffPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    /// Time to wait before the next attempt. Zero when `retry` is false.
    pub delay: Duration,
}

impl RetryDecision {
    const GIVE_UP: RetryDecision = RetryDecision {
        retry: false,
        delay: Duration::ZERO,
    };
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Decides whether the `attempt`-th consecutive failure of `kind` is retried.
    ///
    /// `attempt` is 1-indexed: the first failure is attempt 1.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        if !kind.is_retryable() || attempt == 0 || attempt > self.config.max_attempts {
            return RetryDecision::GIVE_UP;
        }

        RetryDecision {
            retry: true,
            delay: self.delay(attempt),
        }
    }

    /// Delay before retrying after the `attempt`-th failure.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.config.max_delay_ms as f64);

        Duration::from_millis(capped_ms as u64)
    }
}

/// Consecutive failure counter for one retried operation.
///
/// A success resets the counter, so the retry budget applies to each run of failures rather than
/// to the lifetime of the operation.
#[derive(Debug)]
pub struct RetryState {
    policy: BackoffPolicy,
    attempts: u32,
    total_retries: u64,
}

impl RetryState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            total_retries: 0,
        }
    }

    /// Records a failure and returns whether, and after which delay, to try again.
    pub fn record_failure(&mut self, error: &EtlError) -> RetryDecision {
        self.attempts = self.attempts.saturating_add(1);
        let decision = self.policy.should_retry(error.kind(), self.attempts);
        if decision.retry {
            self.total_retries += 1;
        }

        decision
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    /// Number of consecutive failures since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Number of retries granted over the lifetime of this state.
    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> BackoffPolicy {
        BackoffPolicy::new(BackoffConfig {
            initial_delay_ms: 100,
            multiplier: 1.3,
            max_delay_ms: 1_000,
            max_attempts: 12,
        })
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let policy = test_policy();

        let delays: Vec<Duration> = (1..=12)
            .map(|attempt| {
                policy
                    .should_retry(ErrorKind::SourceUnavailable, attempt)
                    .delay
            })
            .collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(130));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= Duration::from_secs(1)));
        assert_eq!(delays[11], Duration::from_secs(1));
    }

    #[test]
    fn schedule_is_deterministic() {
        let policy = test_policy();

        for attempt in 1..=12 {
            assert_eq!(
                policy.should_retry(ErrorKind::SourceDeadlineExceeded, attempt),
                policy.should_retry(ErrorKind::SourceDeadlineExceeded, attempt)
            );
        }
    }

    #[test]
    fn non_retryable_kinds_are_never_retried() {
        let policy = test_policy();

        for kind in [
            ErrorKind::SourceTransportFailed,
            ErrorKind::DecodeFailed,
            ErrorKind::AuthenticationFailed,
            ErrorKind::SessionFailed,
            ErrorKind::Timeout,
        ] {
            let decision = policy.should_retry(kind, 1);
            assert!(!decision.retry);
            assert_eq!(decision.delay, Duration::ZERO);
        }
    }

    #[test]
    fn retry_budget_is_exhausted_after_max_attempts() {
        let policy = test_policy();

        assert!(policy.should_retry(ErrorKind::SourceUnavailable, 12).retry);
        assert!(!policy.should_retry(ErrorKind::SourceUnavailable, 13).retry);
    }

    #[test]
    fn huge_attempt_numbers_stay_capped() {
        let policy = BackoffPolicy::new(BackoffConfig {
            max_attempts: u32::MAX,
            ..BackoffConfig::default()
        });

        let decision = policy.should_retry(ErrorKind::SourceUnavailable, u32::MAX);
        assert!(decision.retry);
        assert_eq!(decision.delay, Duration::from_secs(60));
    }

    #[test]
    fn success_resets_consecutive_attempts() {
        let mut state = RetryState::new(BackoffPolicy::new(BackoffConfig {
            max_attempts: 2,
            ..BackoffConfig::default()
        }));
        let error = EtlError::from((ErrorKind::SourceUnavailable, "unavailable"));

        assert!(state.record_failure(&error).retry);
        assert!(state.record_failure(&error).retry);
        state.record_success();
        assert_eq!(state.attempts(), 0);
        assert!(state.record_failure(&error).retry);
        assert!(state.record_failure(&error).retry);
        assert!(!state.record_failure(&error).retry);
        assert_eq!(state.total_retries(), 4);
    }
}
