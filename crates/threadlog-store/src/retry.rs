//! Full-jitter exponential backoff for remote statement executors.
//!
//! Only [`StoreError::is_remote_transient`] failures (cold start,
//! throttling) are retried. Everything else, deadlocks included, is handed
//! back on the first occurrence.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::StoreError;

/// Default attempt bound, first call included.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry, in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Default cap on a single delay, in seconds.
const DEFAULT_MAX_DELAY_SECS: u64 = 10;

/// Maps a capped exponential delay to the delay actually slept.
pub type JitterFn = fn(Duration) -> Duration;

/// Uniformly random delay in `[0, delay]`.
pub fn full_jitter(delay: Duration) -> Duration {
    let ceiling = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
}

/// The delay unchanged; makes backoff deterministic.
pub const fn no_jitter(delay: Duration) -> Duration {
    delay
}

/// Retry policy applied to every pooled executor call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per call, first call included.
    pub max_attempts: u32,
    /// Exponential base delay.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Jitter applied to every capped delay.
    pub jitter: JitterFn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            jitter: full_jitter,
        }
    }
}

impl RetryPolicy {
    /// Set the attempt bound.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base and cap of the exponential delay.
    #[must_use]
    pub const fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Replace the jitter function.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-based):
    /// `jitter(min(max_delay, base_delay * 2^attempt))`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = 2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        (self.jitter)(exponential.min(self.max_delay))
    }

    /// Run `operation` until it succeeds, fails non-transiently, or runs
    /// out of attempts.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Remote statement succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_remote_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt.saturating_sub(1));
                    tracing::warn!(
                        attempt,
                        error = %err,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Transient failure, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_remote_transient() {
                        tracing::error!(attempt, error = %err, "Remote statement failed after all retries");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::TransientKind;

    fn throttled() -> StoreError {
        StoreError::Transient {
            kind: TransientKind::Throttled,
            message: "rate exceeded".to_owned(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_delays(Duration::from_millis(1), Duration::from_millis(4))
            .with_jitter(no_jitter)
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = policy();
        let delays: Vec<_> = (0..5).map(|attempt| policy.backoff(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(4),
                Duration::from_millis(4),
            ]
        );
        assert_eq!(policy.backoff(200), Duration::from_millis(4));
    }

    #[test]
    fn full_jitter_stays_within_the_delay() {
        for _ in 0..100 {
            assert!(full_jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy()
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(throttled())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = policy()
            .with_max_attempts(3)
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(throttled())
                }
            })
            .await;
        assert!(matches!(result, Err(StoreError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = policy()
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::Deadlock("victim".to_owned()))
                }
            })
            .await;
        assert!(matches!(result, Err(StoreError::Deadlock(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
