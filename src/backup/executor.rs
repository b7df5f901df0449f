use crate::backup::model::{BackupStatus, ClusterBackupResult};
use crate::backup::steps::{StepPlanRequest, StepProvider};
use crate::config::types::BackupExecutionConfig;
use crate::error::BackupError;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct ExecState {
    success_count: u64,
    failure_count: u64,
    /// True iff the last run succeeded. New executors start healthy.
    healthy: bool,
    last_execution: Option<DateTime<Utc>>,
}

/// Read-only copy of an executor's counters and health.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutorSnapshot {
    pub cluster_name: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub healthy: bool,
    pub last_execution: Option<DateTime<Utc>>,
}

/// Per-cluster backup worker. Holds the resolved backup configuration and
/// drives one run as a sequence of budgeted steps; the step sequence itself
/// comes from the [`StepProvider`].
pub struct BackupExecutor {
    cluster_name: String,
    config: BackupExecutionConfig,
    steps: Arc<dyn StepProvider>,
    state: Mutex<ExecState>,
}

impl BackupExecutor {
    pub fn new(
        cluster_name: &str,
        config: BackupExecutionConfig,
        steps: Arc<dyn StepProvider>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            config,
            steps,
            state: Mutex::new(ExecState {
                healthy: true,
                ..ExecState::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.cluster_name
    }

    pub fn config(&self) -> &BackupExecutionConfig {
        &self.config
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().unwrap().healthy
    }

    pub fn failure_count(&self) -> u64 {
        self.state.lock().unwrap().failure_count
    }

    pub fn snapshot(&self) -> ExecutorSnapshot {
        let state = self.state.lock().unwrap();
        ExecutorSnapshot {
            cluster_name: self.cluster_name.clone(),
            success_count: state.success_count,
            failure_count: state.failure_count,
            healthy: state.healthy,
            last_execution: state.last_execution,
        }
    }

    /// Run one backup. Cancellation is observed at every step boundary and
    /// during the step itself; a cancelled run terminates with `Cancelled`
    /// and leaves the counters untouched except for `last_execution`.
    pub async fn run(&self, cancel: &CancellationToken) -> ClusterBackupResult {
        let prefix = format!("{}/{}", self.config.storage_prefix, self.cluster_name);
        let mut result = ClusterBackupResult::started(&self.cluster_name, &prefix);
        info!(
            "executor: run started, cluster={}, backup_id={}",
            self.cluster_name, result.backup_id
        );

        let request = StepPlanRequest {
            cluster_name: self.cluster_name.clone(),
            config: self.config.clone(),
            storage_location: result.storage_location.clone(),
        };
        let steps = self.steps.plan(&request);

        let mut cancelled = false;
        for step in steps {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            debug!(
                "executor: step started, cluster={}, step={}",
                self.cluster_name, step.name
            );
            let outcome = tokio::select! {
                timed = tokio::time::timeout(step.budget, step.work) => match timed {
                    Ok(inner) => inner,
                    Err(_) => Err(BackupError::Timeout(format!(
                        "step {} exceeded its {}s budget",
                        step.name,
                        step.budget.as_secs()
                    ))),
                },
                _ = cancel.cancelled() => Err(BackupError::Cancelled),
            };

            match outcome {
                Ok(report) => {
                    result.namespace_count += report.namespaces;
                    result.resource_count += report.resources;
                    result.total_size_bytes += report.raw_bytes;
                    result.compressed_size_bytes += report.compressed_bytes;
                    result.warnings.extend(report.warnings);
                }
                Err(BackupError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "executor: step failed, cluster={}, step={}, error={}",
                        self.cluster_name, step.name, e
                    );
                    result.errors.push(format!("step {}: {}", step.name, e));
                    break;
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        state.last_execution = Some(Utc::now());

        if cancelled {
            result.finish(BackupStatus::Cancelled);
            info!("executor: run cancelled, cluster={}", self.cluster_name);
            return result;
        }

        if result.errors.is_empty() {
            result.finish(BackupStatus::Completed);
            state.success_count += 1;
            state.healthy = true;
        } else {
            result.finish(BackupStatus::Failed);
            state.failure_count += 1;
            state.healthy = false;
        }
        drop(state);

        metrics::counter!(
            "atlas_backup_runs_total",
            "cluster" => self.cluster_name.clone(),
            "status" => if result.status == BackupStatus::Completed { "completed" } else { "failed" },
        )
        .increment(1);
        metrics::histogram!(
            "atlas_backup_duration_seconds",
            "cluster" => self.cluster_name.clone(),
        )
        .record(result.duration_secs);

        info!(
            "executor: run finished, cluster={}, status={:?}, namespaces={}, resources={}, duration={:.3}s",
            self.cluster_name,
            result.status,
            result.namespace_count,
            result.resource_count,
            result.duration_secs
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::steps::{BackupStep, StepReport};
    use std::time::Duration;

    /// Scripted step sequence: each entry is (name, budget, outcome).
    struct Scripted {
        script: Vec<(&'static str, Duration, Result<StepReport, String>)>,
    }

    impl StepProvider for Scripted {
        fn plan(&self, _request: &StepPlanRequest) -> Vec<BackupStep> {
            self.script
                .iter()
                .map(|&(name, budget, ref outcome)| {
                    let outcome = outcome.clone();
                    BackupStep {
                        name,
                        budget,
                        work: Box::pin(async move {
                            outcome.map_err(BackupError::NonRetryable)
                        }),
                    }
                })
                .collect()
        }
    }

    fn ok_report(resources: u32) -> Result<StepReport, String> {
        Ok(StepReport {
            resources,
            raw_bytes: resources as u64 * 100,
            ..StepReport::default()
        })
    }

    fn executor(script: Vec<(&'static str, Duration, Result<StepReport, String>)>) -> BackupExecutor {
        BackupExecutor::new(
            "c1",
            BackupExecutionConfig::default(),
            Arc::new(Scripted { script }),
        )
    }

    const B: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let exec = executor(vec![("a", B, ok_report(3)), ("b", B, ok_report(2))]);
        let result = exec.run(&CancellationToken::new()).await;
        assert_eq!(result.status, BackupStatus::Completed);
        assert_eq!(result.resource_count, 5);
        assert_eq!(result.total_size_bytes, 500);
        assert!(result.errors.is_empty());
        assert!(exec.is_healthy());
        let snap = exec.snapshot();
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.last_execution.is_some());
    }

    #[tokio::test]
    async fn test_step_failure_stops_the_run() {
        let exec = executor(vec![
            ("a", B, ok_report(1)),
            ("b", B, Err("disk full".to_string())),
            ("c", B, ok_report(9)),
        ]);
        let result = exec.run(&CancellationToken::new()).await;
        assert_eq!(result.status, BackupStatus::Failed);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("step b"));
        // step c never ran
        assert_eq!(result.resource_count, 1);
        assert!(!exec.is_healthy());
        assert_eq!(exec.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_is_cancelled() {
        let exec = executor(vec![("a", B, ok_report(1))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = exec.run(&cancel).await;
        assert_eq!(result.status, BackupStatus::Cancelled);
        // counters untouched except last_execution
        let snap = exec.snapshot();
        assert_eq!(snap.success_count, 0);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.last_execution.is_some());
        assert!(snap.healthy);
    }

    #[tokio::test]
    async fn test_cancellation_mid_step() {
        struct Hanging;
        impl StepProvider for Hanging {
            fn plan(&self, _request: &StepPlanRequest) -> Vec<BackupStep> {
                vec![BackupStep {
                    name: "hang",
                    budget: Duration::from_secs(60),
                    work: Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(StepReport::default())
                    }),
                }]
            }
        }
        let exec = BackupExecutor::new(
            "c1",
            BackupExecutionConfig::default(),
            Arc::new(Hanging),
        );
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let start = std::time::Instant::now();
        let result = exec.run(&cancel).await;
        assert_eq!(result.status, BackupStatus::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_step_budget_enforced() {
        struct Slow;
        impl StepProvider for Slow {
            fn plan(&self, _request: &StepPlanRequest) -> Vec<BackupStep> {
                vec![BackupStep {
                    name: "slow",
                    budget: Duration::from_millis(20),
                    work: Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(StepReport::default())
                    }),
                }]
            }
        }
        let exec = BackupExecutor::new("c1", BackupExecutionConfig::default(), Arc::new(Slow));
        let result = exec.run(&CancellationToken::new()).await;
        assert_eq!(result.status, BackupStatus::Failed);
        assert!(result.errors[0].contains("budget"));
    }

    #[tokio::test]
    async fn test_backup_id_and_location_shape() {
        let exec = executor(vec![("a", B, ok_report(0))]);
        let result = exec.run(&CancellationToken::new()).await;
        assert!(result.backup_id.starts_with("c1-"));
        assert!(result.storage_location.starts_with("backups/c1/"));
    }

    #[tokio::test]
    async fn test_health_recovers_on_next_success() {
        let failing = executor(vec![("a", B, Err("boom".to_string()))]);
        failing.run(&CancellationToken::new()).await;
        assert!(!failing.is_healthy());

        let ok = executor(vec![("a", B, ok_report(1))]);
        ok.run(&CancellationToken::new()).await;
        assert!(ok.is_healthy());
    }
}
