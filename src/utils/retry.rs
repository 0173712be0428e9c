//! Composable retry policy with exponential backoff
//!
//! Shared by the dependency injector and any other retrying collaborator so
//! backoff behavior is tuned in one place instead of ad hoc sleep loops.

use std::future::Future;
use std::time::Duration;

/// Retry policy: bounded attempts with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts (including the first)
    pub max_attempts: usize,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub multiplier: f64,
    /// Ceiling for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt bound and base delay
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given zero-based failed attempt
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }

    /// Run `operation` until it succeeds or attempts are exhausted
    ///
    /// The final error is returned unchanged; intermediate failures are logged
    /// with the attempt count and the computed backoff delay.
    pub async fn run<T, E, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            "{} succeeded on attempt {}/{}",
                            operation_name,
                            attempt + 1,
                            self.max_attempts
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt + 1 < self.max_attempts {
                        let delay = self.delay_for_attempt(attempt);
                        tracing::warn!(
                            "{} failed on attempt {}/{}: {} (retrying in {:?})",
                            operation_name,
                            attempt + 1,
                            self.max_attempts,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        tracing::error!(
                            "{} failed on final attempt {}/{}: {}",
                            operation_name,
                            attempt + 1,
                            self.max_attempts,
                            e
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.expect("retry loop ran at least one attempt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        // 400ms capped at 350ms
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result: Result<&str, String> = policy
            .run("flaky-op", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_and_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result: Result<(), String> = policy
            .run("always-fails", move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure {}", n))
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), "failure 1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
