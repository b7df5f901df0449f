use crate::backup::circuit_breaker::CircuitBreaker;
use crate::backup::executor::BackupExecutor;
use crate::backup::model::{BackupStatus, ClusterBackupResult, MultiClusterBackupResult};
use crate::backup::retry::RetryPolicy;
use crate::config::types::{MultiClusterConfig, UNKNOWN_PRIORITY};
use crate::error::BackupError;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Drives one multi-cluster run: selects executors, orders them, and
/// dispatches sequentially or in bounded-parallel batches. Every executor
/// invocation flows breaker → retry → executor.
pub struct BackupScheduler {
    mode: String,
    strategy: String,
    failure_threshold: u32,
    priorities: HashMap<String, i32>,
    max_concurrent: usize,
    timeout: Duration,
    retry: RetryPolicy,
}

impl BackupScheduler {
    pub fn new(mc: &MultiClusterConfig) -> Self {
        Self {
            mode: mc.mode.clone(),
            strategy: mc.scheduling.strategy.clone(),
            failure_threshold: mc.coordination.failure_threshold,
            priorities: mc.scheduling.priority_map(),
            max_concurrent: mc.scheduling.max_concurrent_clusters.max(1),
            timeout: mc.coordination.timeout(),
            retry: RetryPolicy::new(mc.coordination.retry_attempts, &mc.coordination.retry),
        }
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Run a backup across `executors` (given in registration order).
    /// `healthy` answers whether the cluster's registry handle is currently
    /// live; unhealthy clusters are recorded as failed without dispatch.
    pub async fn execute(
        &self,
        executors: &[Arc<BackupExecutor>],
        healthy: impl Fn(&str) -> bool,
        breakers: &DashMap<String, Arc<CircuitBreaker>>,
        cancel: &CancellationToken,
    ) -> MultiClusterBackupResult {
        let ordered = self.order(executors);
        let mut result = MultiClusterBackupResult::new(&self.mode, ordered.len() as u32);
        info!(
            "scheduler: run started, mode={}, clusters={}, failure_threshold={}",
            self.mode,
            ordered.len(),
            self.failure_threshold
        );

        // Top-level deadline derived from coordination.timeout.
        let deadline = cancel.child_token();
        let watchdog = {
            let deadline = deadline.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!("scheduler: coordination timeout reached, cancelling run");
                deadline.cancel();
            })
        };

        if self.mode == "parallel" {
            self.execute_parallel(&ordered, &healthy, breakers, &deadline, &mut result)
                .await;
        } else {
            self.execute_sequential(&ordered, &healthy, breakers, &deadline, &mut result)
                .await;
        }

        watchdog.abort();
        result.finalize(self.failure_threshold);
        info!(
            "scheduler: run finished, status={:?}, successful={}, failed={}",
            result.overall_status, result.successful_clusters, result.failed_clusters
        );
        result
    }

    /// Priority order when the priority strategy is active (stable: ties
    /// keep registration order, unknown clusters sort at priority 99);
    /// least-loaded orders by executor failure count; otherwise
    /// registration order.
    fn order(&self, executors: &[Arc<BackupExecutor>]) -> Vec<Arc<BackupExecutor>> {
        let mut ordered: Vec<Arc<BackupExecutor>> = executors.to_vec();
        match self.strategy.as_str() {
            "priority" if !self.priorities.is_empty() => {
                ordered.sort_by_key(|e| {
                    self.priorities
                        .get(e.name())
                        .copied()
                        .unwrap_or(UNKNOWN_PRIORITY)
                });
            }
            "least_loaded" => {
                ordered.sort_by_key(|e| e.failure_count());
            }
            _ => {}
        }
        ordered
    }

    async fn execute_sequential(
        &self,
        ordered: &[Arc<BackupExecutor>],
        healthy: &impl Fn(&str) -> bool,
        breakers: &DashMap<String, Arc<CircuitBreaker>>,
        cancel: &CancellationToken,
        result: &mut MultiClusterBackupResult,
    ) {
        for executor in ordered {
            let outcome = self
                .run_one(executor.clone(), healthy, breakers, cancel)
                .await;
            result.record(outcome);

            if result.failed_clusters > self.failure_threshold {
                warn!(
                    "scheduler: failure threshold exceeded ({} > {}), stopping run",
                    result.failed_clusters, self.failure_threshold
                );
                break;
            }
        }
    }

    async fn execute_parallel(
        &self,
        ordered: &[Arc<BackupExecutor>],
        healthy: &impl Fn(&str) -> bool,
        breakers: &DashMap<String, Arc<CircuitBreaker>>,
        cancel: &CancellationToken,
        result: &mut MultiClusterBackupResult,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        for batch in ordered.chunks(self.max_concurrent) {
            let futures = batch.iter().map(|executor| {
                let executor = executor.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                async move {
                    let _permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit.expect("semaphore not closed"),
                        _ = cancel.cancelled() => {
                            return cancelled_result(executor.name());
                        }
                    };
                    self.run_one(executor, healthy, breakers, &cancel).await
                }
            });

            // Join the whole batch before starting the next one.
            for outcome in join_all(futures).await {
                result.record(outcome);
            }
        }
    }

    /// One guarded invocation: breaker → retry → executor.
    async fn run_one(
        &self,
        executor: Arc<BackupExecutor>,
        healthy: &impl Fn(&str) -> bool,
        breakers: &DashMap<String, Arc<CircuitBreaker>>,
        cancel: &CancellationToken,
    ) -> ClusterBackupResult {
        let name = executor.name().to_string();

        if !healthy(&name) {
            warn!("scheduler: skipping unhealthy cluster, name={}", name);
            return failed_result(&name, &BackupError::ClusterUnhealthy(name.clone()));
        }

        let breaker = breakers
            .entry(name.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(&name, 5, Duration::from_secs(60))))
            .clone();

        // The retry loop re-runs the executor, so the aggregate needs the
        // last attempt's real result when everything fails.
        let last_attempt: Arc<Mutex<Option<ClusterBackupResult>>> = Arc::new(Mutex::new(None));

        let outcome = breaker
            .execute(|| {
                let executor = executor.clone();
                let last_attempt = last_attempt.clone();
                let cancel = cancel.clone();
                async move {
                    let attempt_cancel = cancel.clone();
                    self.retry
                        .run(&cancel, BackupError::is_retryable, move || {
                            let executor = executor.clone();
                            let last_attempt = last_attempt.clone();
                            let cancel = attempt_cancel.clone();
                            async move {
                                let result = executor.run(&cancel).await;
                                match result.status {
                                    BackupStatus::Completed => Ok(result),
                                    BackupStatus::Cancelled => {
                                        *last_attempt.lock().unwrap() = Some(result);
                                        Err(BackupError::Cancelled)
                                    }
                                    _ => {
                                        let error = result
                                            .errors
                                            .first()
                                            .map(|e| BackupError::classify(e.clone()))
                                            .unwrap_or_else(|| {
                                                BackupError::NonRetryable("backup failed".into())
                                            });
                                        *last_attempt.lock().unwrap() = Some(result);
                                        Err(error)
                                    }
                                }
                            }
                        })
                        .await
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(error) => {
                let stored = last_attempt.lock().unwrap().take();
                match stored {
                    Some(result) => result,
                    // BreakerOpen (or pre-run cancellation): the executor was
                    // never invoked, synthesize the failed attempt.
                    None => match error {
                        BackupError::Cancelled => cancelled_result(&name),
                        e => failed_result(&name, &e),
                    },
                }
            }
        }
    }
}

fn failed_result(cluster: &str, error: &BackupError) -> ClusterBackupResult {
    let mut result = ClusterBackupResult::started(cluster, "backups");
    result.errors.push(error.to_string());
    result.finish(BackupStatus::Failed);
    result
}

fn cancelled_result(cluster: &str) -> ClusterBackupResult {
    let mut result = ClusterBackupResult::started(cluster, "backups");
    result.finish(BackupStatus::Cancelled);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::steps::{BackupStep, StepPlanRequest, StepProvider, StepReport};
    use crate::config::types::{
        BackupExecutionConfig, ClusterPriority, CoordinationConfig, RetryTuning, SchedulingConfig,
    };
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Step provider that records run start times and fails the first
    /// `failures` invocations.
    struct Probe {
        name: &'static str,
        failures: u32,
        delay: Duration,
        calls: Arc<AtomicU32>,
        starts: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
    }

    impl StepProvider for Probe {
        fn plan(&self, _request: &StepPlanRequest) -> Vec<BackupStep> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.starts
                .lock()
                .unwrap()
                .push((self.name.to_string(), Utc::now()));
            let fail = call < self.failures;
            let delay = self.delay;
            vec![BackupStep {
                name: "snapshot",
                budget: Duration::from_secs(30),
                work: Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    if fail {
                        Err(BackupError::NonRetryable("simulated failure".into()))
                    } else {
                        Ok(StepReport {
                            resources: 1,
                            ..StepReport::default()
                        })
                    }
                }),
            }]
        }
    }

    struct Fixture {
        executors: Vec<Arc<BackupExecutor>>,
        starts: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
        breakers: DashMap<String, Arc<CircuitBreaker>>,
    }

    impl Fixture {
        /// `spec` entries: (name, failing runs before success, per-run delay).
        fn new(spec: &[(&'static str, u32, Duration)]) -> Self {
            let starts = Arc::new(Mutex::new(Vec::new()));
            let executors = spec
                .iter()
                .map(|&(name, failures, delay)| {
                    Arc::new(BackupExecutor::new(
                        name,
                        BackupExecutionConfig::default(),
                        Arc::new(Probe {
                            name,
                            failures,
                            delay,
                            calls: Arc::new(AtomicU32::new(0)),
                            starts: starts.clone(),
                        }),
                    ))
                })
                .collect();
            Self {
                executors,
                starts,
                breakers: DashMap::new(),
            }
        }

        fn start_order(&self) -> Vec<String> {
            self.starts
                .lock()
                .unwrap()
                .iter()
                .map(|(n, _)| n.clone())
                .collect()
        }
    }

    fn scheduler(mode: &str, threshold: u32, retries: u32) -> BackupScheduler {
        scheduler_with(mode, threshold, retries, "round_robin", &[], 2)
    }

    fn scheduler_with(
        mode: &str,
        threshold: u32,
        retries: u32,
        strategy: &str,
        priorities: &[(&str, i32)],
        max_concurrent: usize,
    ) -> BackupScheduler {
        BackupScheduler::new(&MultiClusterConfig {
            enabled: true,
            mode: mode.to_string(),
            coordination: CoordinationConfig {
                timeout_secs: 30,
                retry_attempts: retries,
                failure_threshold: threshold,
                retry: RetryTuning {
                    initial_delay_ms: 1,
                    max_delay_ms: 2,
                    multiplier: 1.0,
                    jitter: false,
                },
                ..CoordinationConfig::default()
            },
            scheduling: SchedulingConfig {
                strategy: strategy.to_string(),
                max_concurrent_clusters: max_concurrent,
                cluster_priorities: priorities
                    .iter()
                    .map(|&(c, p)| ClusterPriority {
                        cluster: c.to_string(),
                        priority: p,
                    })
                    .collect(),
            },
            ..MultiClusterConfig::default()
        })
    }

    const FAST: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn test_sequential_all_succeed() {
        let fx = Fixture::new(&[("c1", 0, FAST), ("c2", 0, FAST)]);
        let sched = scheduler("sequential", 1, 0);
        let result = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;

        assert_eq!(result.overall_status, BackupStatus::Completed);
        assert_eq!(result.total_clusters, 2);
        assert_eq!(result.successful_clusters, 2);
        assert_eq!(result.failed_clusters, 0);
        assert_eq!(fx.start_order(), vec!["c1", "c2"]);
        assert_eq!(
            result.total_clusters,
            result.successful_clusters + result.failed_clusters
        );
    }

    #[tokio::test]
    async fn test_priority_order_stable() {
        let fx = Fixture::new(&[
            ("c3", 0, FAST),
            ("c1", 0, FAST),
            ("c2", 0, FAST),
            ("c4", 0, FAST),
        ]);
        // c1 and c2 share priority 1; c4 has no entry and sorts at 99.
        let sched = scheduler_with(
            "sequential",
            4,
            0,
            "priority",
            &[("c3", 2), ("c1", 1), ("c2", 1)],
            2,
        );
        let result = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;

        assert_eq!(result.successful_clusters, 4);
        // ties keep registration order: c1 before c2
        assert_eq!(fx.start_order(), vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_sequential_failure_within_threshold_continues() {
        // Scenario: c1 fails, c2 succeeds, threshold 1, no retries.
        let fx = Fixture::new(&[("c1", 10, FAST), ("c2", 0, FAST)]);
        let sched = scheduler_with("sequential", 1, 0, "priority", &[("c1", 1), ("c2", 2)], 2);
        let result = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;

        assert_eq!(result.cluster_results.len(), 2);
        assert_eq!(
            result.cluster_results["c1"].status,
            BackupStatus::Failed
        );
        assert_eq!(
            result.cluster_results["c2"].status,
            BackupStatus::Completed
        );
        assert_eq!(result.overall_status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn test_sequential_stops_beyond_threshold() {
        let fx = Fixture::new(&[("c1", 10, FAST), ("c2", 10, FAST), ("c3", 0, FAST)]);
        let sched = scheduler("sequential", 1, 0);
        let result = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;

        // c1 and c2 fail; 2 > threshold 1 stops the run, c3 absent.
        assert_eq!(result.cluster_results.len(), 2);
        assert!(!result.cluster_results.contains_key("c3"));
        assert_eq!(result.failed_clusters, 2);
        assert_eq!(result.overall_status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_cluster() {
        // One failing run, then success; errors classified retryable.
        let starts = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(BackupExecutor::new(
            "flaky",
            BackupExecutionConfig::default(),
            Arc::new(FlakyRetryable {
                calls: Arc::new(AtomicU32::new(0)),
                starts: starts.clone(),
            }),
        ));
        let sched = scheduler("sequential", 0, 2);
        let breakers = DashMap::new();
        let result = sched
            .execute(&[executor], |_| true, &breakers, &CancellationToken::new())
            .await;
        assert_eq!(result.overall_status, BackupStatus::Completed);
        assert_eq!(result.cluster_results["flaky"].status, BackupStatus::Completed);
    }

    struct FlakyRetryable {
        calls: Arc<AtomicU32>,
        starts: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
    }

    impl StepProvider for FlakyRetryable {
        fn plan(&self, _request: &StepPlanRequest) -> Vec<BackupStep> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.starts
                .lock()
                .unwrap()
                .push(("flaky".to_string(), Utc::now()));
            vec![BackupStep {
                name: "snapshot",
                budget: Duration::from_secs(30),
                work: Box::pin(async move {
                    if call == 0 {
                        Err(BackupError::Retryable("connection reset by peer".into()))
                    } else {
                        Ok(StepReport::default())
                    }
                }),
            }]
        }
    }

    #[tokio::test]
    async fn test_unhealthy_cluster_recorded_without_dispatch() {
        let fx = Fixture::new(&[("c1", 0, FAST), ("c2", 0, FAST)]);
        let sched = scheduler("sequential", 5, 0);
        let result = sched
            .execute(
                &fx.executors,
                |name| name != "c1",
                &fx.breakers,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.cluster_results["c1"].status, BackupStatus::Failed);
        assert!(result.cluster_results["c1"].errors[0].contains("unhealthy"));
        assert_eq!(result.cluster_results["c2"].status, BackupStatus::Completed);
        // c1's executor never ran
        assert_eq!(fx.start_order(), vec!["c2"]);
    }

    #[tokio::test]
    async fn test_parallel_batches_preserve_order() {
        let slow = Duration::from_millis(30);
        let fx = Fixture::new(&[
            ("c1", 0, slow),
            ("c2", 0, slow),
            ("c3", 0, slow),
            ("c4", 0, slow),
            ("c5", 0, slow),
        ]);
        let sched = scheduler_with("parallel", 5, 0, "round_robin", &[], 2);
        let result = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;

        assert_eq!(result.successful_clusters, 5);
        assert_eq!(result.cluster_results.len(), 5);

        // Batches are {c1,c2},{c3,c4},{c5}: every member of batch i starts
        // after every member of batch i-1 finished.
        let starts = fx.starts.lock().unwrap();
        let start_of = |name: &str| {
            starts
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, t)| *t)
                .unwrap()
        };
        let end_of = |name: &str| result.cluster_results[name].end_time;

        for earlier in ["c1", "c2"] {
            for later in ["c3", "c4"] {
                assert!(
                    start_of(later) >= end_of(earlier),
                    "{} started before {} finished",
                    later,
                    earlier
                );
            }
        }
        for earlier in ["c3", "c4"] {
            assert!(start_of("c5") >= end_of(earlier));
        }
    }

    #[tokio::test]
    async fn test_parallel_failures_do_not_stop_batches() {
        let fx = Fixture::new(&[("c1", 10, FAST), ("c2", 0, FAST), ("c3", 0, FAST)]);
        let sched = scheduler_with("parallel", 0, 0, "round_robin", &[], 2);
        let result = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;

        assert_eq!(result.cluster_results.len(), 3);
        assert_eq!(result.failed_clusters, 1);
        // threshold 0 with one failure → Failed overall
        assert_eq!(result.overall_status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_coordination_timeout_cancels_run() {
        let fx = Fixture::new(&[("c1", 0, Duration::from_secs(30))]);
        let mut sched = scheduler("sequential", 0, 0);
        sched.timeout = Duration::from_millis(30);
        let started = std::time::Instant::now();
        let result = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.cluster_results["c1"].status, BackupStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_breaker_open_recorded_without_invocation() {
        let fx = Fixture::new(&[("c1", 0, FAST)]);
        // Pre-open the breaker.
        let breaker = Arc::new(CircuitBreaker::new("c1", 1, Duration::from_secs(600)));
        let _ = breaker
            .execute(|| async { Err::<(), _>(BackupError::NonRetryable("prime".into())) })
            .await;
        fx.breakers.insert("c1".to_string(), breaker);

        let sched = scheduler("sequential", 0, 0);
        let result = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;

        assert_eq!(result.cluster_results["c1"].status, BackupStatus::Failed);
        assert!(result.cluster_results["c1"].errors[0].contains("circuit breaker open"));
        // the executor itself was never invoked
        assert!(fx.start_order().is_empty());
    }

    #[tokio::test]
    async fn test_run_twice_same_shape() {
        let fx = Fixture::new(&[("c1", 0, FAST), ("c2", 0, FAST)]);
        let sched = scheduler_with("sequential", 2, 0, "priority", &[("c1", 1), ("c2", 2)], 2);

        let first = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;
        let second = sched
            .execute(&fx.executors, |_| true, &fx.breakers, &CancellationToken::new())
            .await;

        assert_eq!(first.total_clusters, second.total_clusters);
        assert_eq!(fx.start_order(), vec!["c1", "c2", "c1", "c2"]);
    }
}
