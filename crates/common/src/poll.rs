//! Bounded polling and retry policies
//!
//! Every wait in certpilot (proxy start, port release, health checks, ACME
//! order status) is expressed as a poll interval plus a maximum elapsed time,
//! or as a bounded retry with exponential backoff. Call sites pass the policy
//! in rather than embedding sleep loops.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

/// Poll an operation at a fixed interval until it succeeds or the
/// maximum elapsed time is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay between two checks
    pub interval: Duration,
    /// Maximum total time spent polling
    pub timeout: Duration,
}

/// Result of a bounded poll
#[derive(Debug)]
pub enum PollOutcome<T, P> {
    /// The check succeeded
    Ready { value: T, attempts: u32, elapsed: Duration },
    /// The deadline passed; carries the last pending observation
    TimedOut {
        last: Option<P>,
        attempts: u32,
        elapsed: Duration,
    },
}

impl<T, P> PollOutcome<T, P> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    /// Convert into a `Result`, discarding attempt accounting
    pub fn into_result(self) -> Result<T, Option<P>> {
        match self {
            PollOutcome::Ready { value, .. } => Ok(value),
            PollOutcome::TimedOut { last, .. } => Err(last),
        }
    }
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Single check, no waiting
    pub const fn once() -> Self {
        Self {
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
        }
    }

    /// Upper bound on the number of checks this policy performs
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let ratio = self.timeout.as_millis() / self.interval.as_millis().max(1);
        u32::try_from(ratio).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Run `check` until it returns `Ok`, the first check happening
    /// immediately. `check` receives the 1-based attempt number.
    ///
    /// The loop never sleeps past the deadline: when the next interval
    /// would overrun it, polling stops with [`PollOutcome::TimedOut`].
    pub async fn poll<F, Fut, T, P>(&self, mut check: F) -> PollOutcome<T, P>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, P>>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last = None;

        loop {
            attempts += 1;
            match check(attempts).await {
                Ok(value) => {
                    trace!(attempts, "Poll condition satisfied");
                    return PollOutcome::Ready {
                        value,
                        attempts,
                        elapsed: start.elapsed(),
                    };
                }
                Err(pending) => last = Some(pending),
            }

            let elapsed = start.elapsed();
            if self.interval.is_zero() || elapsed + self.interval > self.timeout {
                debug!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Poll deadline reached"
                );
                return PollOutcome::TimedOut {
                    last,
                    attempts,
                    elapsed,
                };
            }

            sleep(self.interval).await;
        }
    }
}

/// Bounded retry with exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Run `operation` until it succeeds or attempts are exhausted,
    /// returning the last error.
    pub async fn retry<F, Fut, T, E>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        operation = %operation,
                        attempts = attempt,
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        operation = %operation,
                        attempt,
                        max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    sleep(delay).await;
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

    #[tokio::test]
    async fn test_poll_ready_on_first_attempt() {
        let policy = PollPolicy::new(Duration::from_millis(10), Duration::from_millis(100));
        let outcome: PollOutcome<u32, ()> = policy.poll(|n| async move { Ok(n) }).await;

        match outcome {
            PollOutcome::Ready { value, attempts, .. } => {
                assert_eq!(value, 1);
                assert_eq!(attempts, 1);
            }
            PollOutcome::TimedOut { .. } => panic!("expected ready"),
        }
    }

    #[tokio::test]
    async fn test_poll_ready_after_retries() {
        let policy = PollPolicy::new(Duration::from_millis(5), Duration::from_secs(1));
        let outcome = policy
            .poll(|n| async move { if n >= 3 { Ok(n) } else { Err(n) } })
            .await;

        assert!(outcome.is_ready());
        assert_eq!(outcome.into_result().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_poll_times_out_with_last_observation() {
        let policy = PollPolicy::new(Duration::from_millis(10), Duration::from_millis(35));
        let outcome: PollOutcome<(), u32> = policy.poll(|n| async move { Err(n) }).await;

        match outcome {
            PollOutcome::TimedOut { last, attempts, elapsed } => {
                assert_eq!(last, Some(attempts));
                assert!(attempts <= policy.max_attempts());
                assert!(elapsed <= Duration::from_millis(200));
            }
            PollOutcome::Ready { .. } => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn test_poll_once_checks_exactly_once() {
        let outcome: PollOutcome<(), ()> = PollPolicy::once().poll(|_| async { Err(()) }).await;
        match outcome {
            PollOutcome::TimedOut { attempts, .. } => assert_eq!(attempts, 1),
            PollOutcome::Ready { .. } => panic!("expected timeout"),
        }
    }

    #[test]
    fn test_max_attempts() {
        let policy = PollPolicy::new(Duration::from_secs(5), Duration::from_secs(120));
        assert_eq!(policy.max_attempts(), 25);
        assert_eq!(PollPolicy::once().max_attempts(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        };

        assert_eq!(policy.backoff_for(0), Duration::ZERO);
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        };

        let result: Result<u32, String> = policy
            .retry("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            multiplier: 1.0,
        };

        let result: Result<(), String> = policy
            .retry("always-fails", |attempt| async move { Err(format!("fail {attempt}")) })
            .await;

        assert_eq!(result.unwrap_err(), "fail 2");
    }

    proptest::proptest! {
        #[test]
        fn test_backoff_never_exceeds_cap(
            attempt in 0u32..64,
            initial_ms in 0u64..10_000,
            max_ms in 0u64..60_000,
            multiplier in 1.0f64..4.0,
        ) {
            let policy = RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                multiplier,
            };

            let delay = policy.backoff_for(attempt);
            proptest::prop_assert!(delay <= Duration::from_millis(max_ms));
            proptest::prop_assert!(delay <= policy.backoff_for(attempt + 1));
        }
    }
}
