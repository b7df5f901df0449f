use crate::auth::AuthResolver;
use crate::backup::circuit_breaker::CircuitBreaker;
use crate::backup::executor::{BackupExecutor, ExecutorSnapshot};
use crate::backup::model::{BackupStatus, MultiClusterBackupResult};
use crate::backup::scheduler::BackupScheduler;
use crate::backup::steps::{ApiStepProvider, FsStoragePlane, StoragePlane};
use crate::cluster::registry::ClusterRegistry;
use crate::config::types::OrchestratorConfig;
use crate::config::validate as config_validate;
use crate::error::BackupError;
use crate::events::{Event, EventBus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default base directory for the in-tree filesystem storage plane.
const DEFAULT_STAGING_DIR: &str = "snapshots";

/// A failed orchestrated run. Carries the aggregated result alongside the
/// typed error so callers can inspect both.
#[derive(Debug)]
pub struct BackupRunError {
    pub error: BackupError,
    pub result: Option<MultiClusterBackupResult>,
}

impl fmt::Display for BackupRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Some(result) => write!(
                f,
                "{} ({} of {} clusters failed)",
                self.error, result.failed_clusters, result.total_clusters
            ),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for BackupRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<BackupError> for BackupRunError {
    fn from(error: BackupError) -> Self {
        Self {
            error,
            result: None,
        }
    }
}

#[derive(Debug, Default)]
struct RunStats {
    total_runs: u64,
    successful_runs: u64,
    failed_runs: u64,
}

/// Cumulative orchestrator counters.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Top-level composition: registry + executors + breakers + scheduler.
/// Children hold non-owning handles; everything is dropped together.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    registry: Arc<ClusterRegistry>,
    executors: Vec<Arc<BackupExecutor>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    scheduler: BackupScheduler,
    bus: Arc<EventBus>,
    stats: Mutex<RunStats>,
    root: CancellationToken,
    active_runs: AtomicU32,
    started_at: DateTime<Utc>,
    started_instant: std::time::Instant,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("started_at", &self.started_at)
            .field("active_runs", &self.active_runs)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the orchestrator with the default filesystem storage plane.
    pub async fn new(config: OrchestratorConfig, bus: Arc<EventBus>) -> Result<Self, BackupError> {
        Self::with_storage_plane(config, bus, Arc::new(FsStoragePlane::new(DEFAULT_STAGING_DIR)))
            .await
    }

    /// Build the orchestrator with an explicit storage plane (the seam for
    /// object-store integrations).
    pub async fn with_storage_plane(
        config: OrchestratorConfig,
        bus: Arc<EventBus>,
        plane: Arc<dyn StoragePlane>,
    ) -> Result<Self, BackupError> {
        // Fail fast on invalid configuration, with the full report.
        let report = config_validate::validate(&config);
        if !report.is_valid() {
            return Err(BackupError::ConfigInvalid(report.format()));
        }
        if !config.multi_cluster.enabled {
            return Err(BackupError::ConfigInvalid(
                "multi_cluster is not enabled".to_string(),
            ));
        }
        if config.multi_cluster.clusters.is_empty() {
            return Err(BackupError::ConfigInvalid(
                "no clusters configured".to_string(),
            ));
        }

        let resolver = AuthResolver::new();
        let registry = Arc::new(
            ClusterRegistry::register(
                &resolver,
                &config.multi_cluster.clusters,
                config.multi_cluster.coordination.probe_interval(),
            )
            .await?,
        );

        let mut executors = Vec::with_capacity(registry.len());
        let breakers = DashMap::new();
        let breaker_tuning = &config.multi_cluster.coordination.circuit_breaker;
        for handle in registry.all() {
            let desc = &handle.descriptor;
            let exec_config = desc.execution_config(&config.backup);
            let provider = ApiStepProvider::new(
                handle.client.clone(),
                handle.resolved.base_url.clone(),
                plane.clone(),
            );
            executors.push(Arc::new(BackupExecutor::new(
                &desc.name,
                exec_config,
                Arc::new(provider),
            )));
            breakers.insert(
                desc.name.clone(),
                Arc::new(CircuitBreaker::new(
                    &desc.name,
                    breaker_tuning.failure_threshold,
                    breaker_tuning.reset_timeout(),
                )),
            );
        }

        let scheduler = BackupScheduler::new(&config.multi_cluster);
        info!(
            "orchestrator: ready, clusters={}, mode={}",
            executors.len(),
            scheduler.mode()
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            executors,
            breakers,
            scheduler,
            bus,
            stats: Mutex::new(RunStats::default()),
            root: CancellationToken::new(),
            active_runs: AtomicU32::new(0),
            started_at: Utc::now(),
            started_instant: std::time::Instant::now(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The registry, for the owner to drive its probe loop.
    pub fn registry(&self) -> Arc<ClusterRegistry> {
        self.registry.clone()
    }

    /// Run one orchestrated multi-cluster backup.
    ///
    /// Pre-flight gates: not shutting down, no run already in flight, and at
    /// least one healthy cluster. When any cluster fails, the error carries
    /// the aggregated result, so callers inspect both.
    pub async fn execute_backup(&self) -> Result<MultiClusterBackupResult, BackupRunError> {
        if self.root.is_cancelled() {
            return Err(BackupError::Cancelled.into());
        }
        if self.active_runs.fetch_add(1, Ordering::SeqCst) > 0 {
            self.active_runs.fetch_sub(1, Ordering::SeqCst);
            return Err(BackupError::NonRetryable(
                "a backup run is already in progress".to_string(),
            )
            .into());
        }
        // Decrement on every exit path.
        let _guard = RunGuard {
            counter: &self.active_runs,
        };

        let healthy = self.registry.healthy();
        if healthy.is_empty() {
            warn!("orchestrator: pre-flight failed, no healthy clusters");
            return Err(BackupError::ClusterUnhealthy("no healthy clusters".to_string()).into());
        }

        self.bus.publish(Event::new(
            "backup_started",
            serde_json::json!({"clusters": self.executors.len()}),
        ));

        let registry = self.registry.clone();
        let result = self
            .scheduler
            .execute(
                &self.executors,
                move |name| registry.is_healthy(name),
                &self.breakers,
                &self.root,
            )
            .await;

        {
            let mut stats = self.stats.lock().unwrap();
            stats.total_runs += 1;
            if result.overall_status == BackupStatus::Completed {
                stats.successful_runs += 1;
            } else {
                stats.failed_runs += 1;
            }
        }
        metrics::counter!(
            "atlas_multi_runs_total",
            "status" => if result.overall_status == BackupStatus::Completed { "completed" } else { "failed" },
        )
        .increment(1);

        let topic = if result.overall_status == BackupStatus::Completed {
            "backup_completed"
        } else {
            "backup_failed"
        };
        self.bus.publish(Event::new(
            topic,
            serde_json::json!({
                "successful": result.successful_clusters,
                "failed": result.failed_clusters,
                "total": result.total_clusters,
            }),
        ));

        if result.failed_clusters > 0 {
            let failed = result.failed_clusters;
            return Err(BackupRunError {
                error: BackupError::NonRetryable(format!("{} cluster backup(s) failed", failed)),
                result: Some(result),
            });
        }
        Ok(result)
    }

    pub fn stats(&self) -> OrchestratorStats {
        let stats = self.stats.lock().unwrap();
        OrchestratorStats {
            total_runs: stats.total_runs,
            successful_runs: stats.successful_runs,
            failed_runs: stats.failed_runs,
            started_at: self.started_at,
            uptime_secs: self.started_instant.elapsed().as_secs(),
        }
    }

    pub fn cluster_status(&self, name: &str) -> Option<ExecutorSnapshot> {
        self.executors
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.snapshot())
    }

    pub fn executor_snapshots(&self) -> Vec<ExecutorSnapshot> {
        self.executors.iter().map(|e| e.snapshot()).collect()
    }

    /// Cancel active executions, stop the registry, and wait for in-flight
    /// runs to drain. If `timeout` fires first the error is returned but the
    /// remaining work is detached, not abandoned mid-await.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), BackupError> {
        info!("orchestrator: shutting down");
        self.root.cancel();
        self.registry.close();

        let drain = async {
            while self.active_runs.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("orchestrator: drained");
                Ok(())
            }
            Err(_) => {
                error!(
                    "orchestrator: shutdown timeout after {}s, detaching {} active run(s)",
                    timeout.as_secs(),
                    self.active_runs.load(Ordering::SeqCst)
                );
                Err(BackupError::Timeout("shutdown drain".to_string()))
            }
        }
    }
}

struct RunGuard<'a> {
    counter: &'a AtomicU32,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
