use crate::error::BackupError;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// Exactly one half-open probe may be in flight.
    probe_in_flight: bool,
}

/// Per-cluster circuit breaker guarding the executor against persistent
/// failure. `execute` is the sole entry; state mutations are serialized
/// behind the mutex so it is safe under concurrent callers.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            threshold: threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Run `op` under the breaker. An Open breaker rejects with
    /// `BreakerOpen` without invoking `op`; once `reset_timeout` has passed
    /// since the last failure a single probe call is admitted.
    ///
    /// A `Cancelled` outcome counts as neither success nor failure.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, BackupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackupError>>,
    {
        self.admit()?;

        let result = op().await;

        let mut inner = self.inner.lock().unwrap();
        match &result {
            Ok(_) => {
                if inner.state != BreakerState::Closed || inner.consecutive_failures > 0 {
                    info!("breaker: closed, cluster={}", self.name);
                }
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
            }
            Err(BackupError::Cancelled) => {
                // Cancellation says nothing about cluster health; release the
                // probe slot so the next caller can try again.
                inner.probe_in_flight = false;
            }
            Err(_) => match inner.state {
                BreakerState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.threshold {
                        inner.state = BreakerState::Open;
                        inner.last_failure = Some(Instant::now());
                        warn!(
                            "breaker: opened, cluster={}, consecutive_failures={}",
                            self.name, inner.consecutive_failures
                        );
                    }
                }
                BreakerState::HalfOpen => {
                    inner.state = BreakerState::Open;
                    inner.last_failure = Some(Instant::now());
                    inner.probe_in_flight = false;
                    warn!("breaker: re-opened after failed probe, cluster={}", self.name);
                }
                BreakerState::Open => {
                    inner.last_failure = Some(Instant::now());
                }
            },
        }
        result
    }

    /// Admission control; mutates state for the Open → HalfOpen transition.
    fn admit(&self) -> Result<(), BackupError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if cooled_down {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("breaker: half-open probe admitted, cluster={}", self.name);
                    Ok(())
                } else {
                    metrics::counter!(
                        "atlas_breaker_rejected_total",
                        "cluster" => self.name.clone(),
                    )
                    .increment(1);
                    Err(BackupError::BreakerOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    metrics::counter!(
                        "atlas_breaker_rejected_total",
                        "cluster" => self.name.clone(),
                    )
                    .increment(1);
                    Err(BackupError::BreakerOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }
}
