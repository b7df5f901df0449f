use crate::config::types::RetryTuning;
use crate::error::BackupError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential-backoff-with-jitter decision function over a retryable-error
/// predicate. Attempt `k` waits `min(max_delay, initial * multiplier^(k-1))`,
/// perturbed by up to ±25% when jitter is enabled. Total invocations are
/// bounded by `max_retries + 1`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, tuning: &RetryTuning) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(tuning.initial_delay_ms),
            max_delay: Duration::from_millis(tuning.max_delay_ms),
            multiplier: tuning.multiplier,
            jitter: tuning.jitter,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry attempt `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Drive `op` until it succeeds, fails terminally, or the attempt budget
    /// is exhausted. Cancellation cuts the backoff wait and returns
    /// `Cancelled` immediately.
    pub async fn run<T, F, Fut, P>(
        &self,
        cancel: &CancellationToken,
        is_retryable: P,
        mut op: F,
    ) -> Result<T, BackupError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackupError>>,
        P: Fn(&BackupError) -> bool,
    {
        let attempts = self.max_retries + 1;
        let mut last_err = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retryable = is_retryable(&e) && attempt < attempts;
                    debug!(
                        "retry: attempt {}/{} failed, retryable={}, error={}",
                        attempt, attempts, retryable, e
                    );
                    if !retryable {
                        return Err(e);
                    }
                    metrics::counter!("atlas_retry_attempts_total").increment(1);
                    last_err = Some(e);
                }
            }

            let delay = self.delay_for(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            }
        }

        Err(last_err.unwrap_or(BackupError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            &RetryTuning {
                initial_delay_ms: 1,
                max_delay_ms: 4,
                multiplier: 2.0,
                jitter: false,
            },
        )
    }

    #[test]
    fn test_base_delay_growth_and_cap() {
        let p = RetryPolicy::new(
            5,
            &RetryTuning {
                initial_delay_ms: 100,
                max_delay_ms: 350,
                multiplier: 2.0,
                jitter: false,
            },
        );
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(350)); // capped
        assert_eq!(p.base_delay(4), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let p = RetryPolicy::new(
            1,
            &RetryTuning {
                initial_delay_ms: 1000,
                max_delay_ms: 10_000,
                multiplier: 2.0,
                jitter: true,
            },
        );
        for _ in 0..64 {
            let d = p.delay_for(1).as_secs_f64();
            assert!((0.75..=1.25).contains(&d), "jittered delay {} out of range", d);
        }
    }

    #[tokio::test]
    async fn test_max_invocations() {
        let p = fast_policy(2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), _> = p
            .run(&cancel, BackupError::is_retryable, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BackupError::Retryable("still down".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // max_retries + 1
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let p = fast_policy(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), _> = p
            .run(&cancel, BackupError::is_retryable, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BackupError::InvalidAuth("bad token".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(BackupError::InvalidAuth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let p = fast_policy(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result = p
            .run(&cancel, BackupError::is_retryable, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BackupError::Retryable("connection reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_cuts_the_wait() {
        let p = RetryPolicy::new(
            3,
            &RetryTuning {
                initial_delay_ms: 60_000,
                max_delay_ms: 60_000,
                multiplier: 1.0,
                jitter: false,
            },
        );
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        let result: Result<(), _> = p
            .run(&cancel, BackupError::is_retryable, || async {
                Err(BackupError::Retryable("timeout".into()))
            })
            .await;

        assert!(matches!(result, Err(BackupError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_breaker_open_not_retried() {
        let p = fast_policy(4);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), _> = p
            .run(&cancel, BackupError::is_retryable, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BackupError::BreakerOpen("c1".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(BackupError::BreakerOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
