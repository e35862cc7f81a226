//! Generic retry executor with exponential backoff and jitter.
//!
//! One executor serves every retry loop in the workspace: the store client
//! (transport failures), the distributed lock (contention) and retry-stream
//! scheduling (delay computation only). Callers decide what is retryable by
//! passing a predicate; the executor only decides *when* to try again.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delay schedule between attempts.
///
/// The delay before retry `n` (1-indexed) is
/// `initial_delay × backoff_factor^(n-1)`, moved by a uniform jitter within
/// `±jitter_factor/2` of itself, and finally capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Same delay before every retry, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Exponential growth without jitter.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor,
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Un-jittered delay for a given attempt number (1-indexed), capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = self.backoff_factor.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_secs_f64() * 1000.0 * exp;
        self.cap_millis(millis)
    }

    /// Jittered delay for a given attempt number (1-indexed), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay using a caller-supplied random source.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.jitter_factor <= 0.0 {
            return base;
        }

        let half = self.jitter_factor / 2.0;
        let offset = rng.gen_range(-half..=half);
        let millis = base.as_secs_f64() * 1000.0 * (1.0 + offset);
        self.cap_millis(millis)
    }

    fn cap_millis(&self, millis: f64) -> Duration {
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        if !millis.is_finite() || millis >= max_ms {
            return self.max_delay;
        }
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }
}

/// Why the executor gave up.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetryError<E> {
    /// The predicate declared the error terminal.
    #[error("{error}")]
    Aborted { attempt: u32, error: E },

    /// Every attempt failed with a retryable error.
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Aborted { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Aborted { attempt, .. } => *attempt,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Runs an async operation until it succeeds, fails terminally, or runs out
/// of attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryExecutor {
    max_attempts: u32,
    policy: BackoffPolicy,
}

impl RetryExecutor {
    /// `max_attempts` counts the first try; zero is treated as one.
    pub fn new(max_attempts: u32, policy: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            policy,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Execute `operation` (called with the 1-indexed attempt number).
    ///
    /// `on_retry(attempt, error, delay)` runs before each backoff sleep. The
    /// sleep is an ordinary await point, so dropping the returned future
    /// cancels the loop immediately.
    pub async fn run<T, E, Op, Fut, P, H>(
        &self,
        mut operation: Op,
        is_retryable: P,
        mut on_retry: H,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        H: FnMut(u32, &E, Duration),
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if !is_retryable(&error) => {
                    return Err(RetryError::Aborted { attempt, error });
                }
                Err(error) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                Err(error) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    on_retry(attempt, &error, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = BackoffPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
        );

        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_respects_max_delay() {
        let policy = BackoffPolicy::exponential(
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
        );

        assert_eq!(policy.base_delay(10), Duration::from_secs(5));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn fixed_policy_never_changes() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(250));
        for attempt in 1..10 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(3, BackoffPolicy::fixed(Duration::from_millis(10)));
        let mut retries = Vec::new();

        let result: Result<&str, RetryError<&str>> = executor
            .run(
                |_| async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection reset")
                    } else {
                        Ok("done")
                    }
                },
                |_| true,
                |attempt, _, delay| retries.push((attempt, delay)),
            )
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            retries,
            vec![(1, Duration::from_millis(10)), (2, Duration::from_millis(10))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(5, BackoffPolicy::default());

        let result: Result<(), RetryError<&str>> = executor
            .run(
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("nil")
                },
                |e| *e != "nil",
                |_, _, _| panic!("must not retry"),
            )
            .await;

        assert_eq!(result, Err(RetryError::Aborted { attempt: 1, error: "nil" }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count() {
        let executor = RetryExecutor::new(2, BackoffPolicy::fixed(Duration::from_millis(1)));

        let result: Result<(), RetryError<String>> = executor
            .run(|attempt| async move { Err(format!("timeout #{}", attempt)) }, |_| true, |_, _, _| {})
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert_eq!(err.to_string(), "operation failed after 2 attempts: timeout #2");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig { cases: 500, ..ProptestConfig::default() })]

            #[test]
            fn delay_never_exceeds_max(
                initial_ms in 1u64..5_000,
                max_ms in 1u64..60_000,
                factor in 1.0f64..4.0,
                jitter in 0.0f64..=1.0,
                attempt in 0u32..200,
            ) {
                let policy = BackoffPolicy {
                    initial_delay: Duration::from_millis(initial_ms),
                    max_delay: Duration::from_millis(max_ms),
                    backoff_factor: factor,
                    jitter_factor: jitter,
                };
                prop_assert!(policy.delay_for_attempt(attempt) <= policy.max_delay);
            }

            #[test]
            fn delays_are_non_decreasing_before_the_cap(
                initial_ms in 1u64..1_000,
                factor in 1.0f64..3.0,
                attempt in 1u32..60,
            ) {
                let policy = BackoffPolicy::exponential(
                    Duration::from_millis(initial_ms),
                    Duration::from_secs(3600),
                    factor,
                );
                prop_assert!(policy.base_delay(attempt) <= policy.base_delay(attempt + 1));
            }
        }
    }
}
