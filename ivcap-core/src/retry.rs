//! Exponential backoff shared by every call site that talks to something flaky.
//!
//! A [`RetryPolicy`] only decides *when* to try again; the operation itself is
//! a closure, so the policy can be exercised without any network I/O.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetrySection;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
    jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
}

/// Returned once every attempt has failed.
#[derive(Debug, Clone)]
pub struct RetryExhausted<E> {
    pub last_error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: 2.0,
            max_delay: None,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given 1-based attempt has failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let mut delay = Duration::from_secs_f64(scaled.min(u32::MAX as f64));
        if let Some(cap) = self.max_delay {
            delay = delay.min(cap);
        }
        delay
    }

    pub async fn run<F, Fut, T, E>(
        &self,
        label: &str,
        operation: F,
    ) -> Result<RetryOutcome<T>, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(label, operation, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but stops at the first error for which
    /// `should_retry` returns false.
    pub async fn run_if<F, Fut, T, E, P>(
        &self,
        label: &str,
        mut operation: F,
        should_retry: P,
    ) -> Result<RetryOutcome<T>, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1u32;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(operation = label, attempts = attempt, "succeeded after retry");
                    }
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt,
                    });
                }
                Err(error) if attempt >= self.max_attempts => {
                    warn!(operation = label, attempts = attempt, error = %error, "retries exhausted");
                    return Err(RetryExhausted {
                        last_error: error,
                        attempts: attempt,
                    });
                }
                Err(error) if !should_retry(&error) => {
                    warn!(operation = label, attempts = attempt, error = %error, "error is not retryable");
                    return Err(RetryExhausted {
                        last_error: error,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let mut delay = self.delay_after(attempt);
                    if !self.jitter.is_zero() {
                        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
                        delay += Duration::from_millis(extra);
                    }
                    warn!(operation = label, attempt, wait = ?delay, error = %error, "retrying operation");
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        let mut policy = RetryPolicy::new(
            section.max_attempts,
            Duration::from_millis(section.base_delay_ms),
        )
        .with_multiplier(section.multiplier)
        .with_jitter(Duration::from_millis(section.jitter_ms));
        if let Some(cap) = section.max_delay_ms {
            policy = policy.with_max_delay(Duration::from_millis(cap));
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delays_double_from_base_and_respect_cap() {
        let policy = RetryPolicy::new(6, Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(3));
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(4), Duration::from_secs(3));
        assert_eq!(policy.delay_after(5), Duration::from_secs(3));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_the_last_permitted_attempt() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = policy
            .run("flaky", move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 4 {
                        Err(format!("transient failure {attempt}"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .expect("fourth attempt succeeds");
        assert_eq!(outcome.result, "done");
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let exhausted = policy
            .run("always-down", |attempt| async move {
                Err::<(), _>(format!("down on attempt {attempt}"))
            })
            .await
            .unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.last_error, "down on attempt 3");
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_non_retryable_error() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500));
        let started = tokio::time::Instant::now();
        let exhausted = policy
            .run_if(
                "rejected",
                |attempt| async move { Err::<(), _>(format!("conflict on attempt {attempt}")) },
                |error: &String| !error.starts_with("conflict"),
            )
            .await
            .unwrap_err();
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(exhausted.last_error, "conflict on attempt 1");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_still_use_the_full_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let exhausted = policy
            .run_if(
                "unavailable",
                |_| async { Err::<(), _>("unavailable".to_string()) },
                |_| true,
            )
            .await
            .unwrap_err();
        assert_eq!(exhausted.attempts, 3);
    }

    #[test]
    fn builds_from_config_section() {
        let policy = RetryPolicy::from(&RetrySection {
            max_attempts: 5,
            base_delay_ms: 250,
            multiplier: 3.0,
            max_delay_ms: Some(1000),
            jitter_ms: 0,
        });
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_after(2), Duration::from_millis(750));
        assert_eq!(policy.delay_after(3), Duration::from_millis(1000));
    }
}
