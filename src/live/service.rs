use crate::config::types::{LiveConfig, OrchestratorConfig};
use crate::events::{Event, EventBus};
use crate::validate::enhanced::EnhancedValidator;
use crate::validate::types::{ClusterValidationResult, EnhancedValidationResult};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Service error rate above which the health loop reports unhealthy.
const UNHEALTHY_ERROR_RATE: f64 = 0.10;

/// One bounded-history entry: when the pass ran, how long it took, and the
/// full result.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub result: EnhancedValidationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub healthy: bool,
    /// Successful validations / total validations for this cluster.
    pub availability: f64,
    pub consecutive_errors: u32,
    pub average_response_time_ms: f64,
    pub last_checked: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub error_rate: f64,
    pub total_validations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub clusters: BTreeMap<String, ClusterHealth>,
    pub service: ServiceHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationServiceMetrics {
    pub total_validations: u64,
    pub successful_validations: u64,
    pub failed_validations: u64,
    pub average_duration_ms: f64,
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub cluster_metrics: BTreeMap<String, ClusterMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterMetrics {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub average_response_time_ms: f64,
    pub availability: f64,
    pub consecutive_failures: u32,
    pub last_check: DateTime<Utc>,
}

/// Summary served by `/validation/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub valid: Option<bool>,
    pub last_run: Option<DateTime<Utc>>,
    pub total_clusters: u32,
    pub valid_clusters: u32,
    pub invalid_clusters: u32,
    pub history_entries: usize,
}

#[derive(Default)]
struct ClusterMetricsState {
    total: u64,
    successful: u64,
    total_response_ms: u64,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MetricsState {
    total: u64,
    successful: u64,
    failed: u64,
    total_duration_ms: u64,
    per_cluster: BTreeMap<String, ClusterMetricsState>,
}

/// The last-result / history / metrics triple, guarded by one mutex.
/// Handler dispatch always happens after the lock is released.
#[derive(Default)]
struct LiveStore {
    last: Option<EnhancedValidationResult>,
    history: VecDeque<HistoryEntry>,
    metrics: MetricsState,
}

struct LiveInner {
    config: OrchestratorConfig,
    settings: LiveConfig,
    validator: EnhancedValidator,
    bus: Arc<EventBus>,
    store: Mutex<LiveStore>,
    /// Lock-free snapshot for the read API.
    health: ArcSwapOption<HealthCheckResult>,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    shutdown: CancellationToken,
}

/// Long-running validation service: a validation loop and a health loop,
/// bounded history, event fan-out, and a snapshot-style read API.
pub struct LiveValidator {
    inner: Arc<LiveInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveValidator {
    pub fn new(config: OrchestratorConfig, bus: Arc<EventBus>) -> Self {
        let settings = config.live.clone();
        let validator = EnhancedValidator::new(&config.validation);
        Self {
            inner: Arc::new(LiveInner {
                config,
                settings,
                validator,
                bus,
                store: Mutex::new(LiveStore::default()),
                health: ArcSwapOption::const_empty(),
                started_at: Utc::now(),
                started_instant: Instant::now(),
                shutdown: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the validation and health loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }
        info!(
            "live: starting, validation_interval={}s, health_interval={}s",
            self.inner.settings.validation_interval_secs,
            self.inner.settings.health_check_interval_secs
        );

        {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                let interval = Duration::from_secs(inner.settings.validation_interval_secs);
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = inner.shutdown.cancelled() => return,
                    }
                    run_validation_cycle(&inner).await;
                }
            }));
        }

        {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                let interval = Duration::from_secs(inner.settings.health_check_interval_secs);
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = inner.shutdown.cancelled() => return,
                    }
                    run_health_cycle(&inner);
                }
            }));
        }
    }

    /// Stop both loops and join them.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("live: loop task error on shutdown: {}", e);
            }
        }
        info!("live: stopped");
    }

    /// Run an immediate validation pass asynchronously.
    pub fn trigger(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_validation_cycle(&inner).await;
        });
    }

    /// Run one validation pass inline. Used by `trigger`, the loops, and
    /// callers that need the result right away.
    pub async fn validate_now(&self) -> EnhancedValidationResult {
        run_validation_cycle(&self.inner).await
    }

    /// Derive and store health from the latest validation immediately.
    pub fn refresh_health(&self) -> Option<HealthCheckResult> {
        run_health_cycle(&self.inner);
        self.health()
    }

    // --- snapshot read API ---

    pub fn health(&self) -> Option<HealthCheckResult> {
        self.inner.health.load_full().map(|h| (*h).clone())
    }

    pub fn last_validation(&self) -> Option<EnhancedValidationResult> {
        self.inner.store.lock().unwrap().last.clone()
    }

    pub fn status_summary(&self) -> StatusSummary {
        let store = self.inner.store.lock().unwrap();
        match &store.last {
            Some(last) => StatusSummary {
                valid: Some(last.valid),
                last_run: Some(last.completed_at),
                total_clusters: last.summary.total_clusters,
                valid_clusters: last.summary.valid_clusters,
                invalid_clusters: last.summary.invalid_clusters,
                history_entries: store.history.len(),
            },
            None => StatusSummary {
                valid: None,
                last_run: None,
                total_clusters: 0,
                valid_clusters: 0,
                invalid_clusters: 0,
                history_entries: store.history.len(),
            },
        }
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.store.lock().unwrap().history.iter().cloned().collect()
    }

    pub fn clusters_health(&self) -> BTreeMap<String, ClusterHealth> {
        self.health().map(|h| h.clusters).unwrap_or_default()
    }

    pub fn cluster_result(&self, name: &str) -> Option<ClusterValidationResult> {
        self.inner
            .store
            .lock()
            .unwrap()
            .last
            .as_ref()
            .and_then(|last| last.cluster_results.get(name).cloned())
    }

    pub fn service_metrics(&self) -> ValidationServiceMetrics {
        let store = self.inner.store.lock().unwrap();
        let m = &store.metrics;
        let average_duration_ms = if m.total > 0 {
            m.total_duration_ms as f64 / m.total as f64
        } else {
            0.0
        };
        let cluster_metrics = m
            .per_cluster
            .iter()
            .map(|(name, s)| {
                (
                    name.clone(),
                    ClusterMetrics {
                        total_checks: s.total,
                        successful_checks: s.successful,
                        average_response_time_ms: if s.total > 0 {
                            s.total_response_ms as f64 / s.total as f64
                        } else {
                            0.0
                        },
                        availability: if s.total > 0 {
                            s.successful as f64 / s.total as f64
                        } else {
                            0.0
                        },
                        consecutive_failures: s.consecutive_failures,
                        last_check: s.last_check.unwrap_or(self.inner.started_at),
                    },
                )
            })
            .collect();

        ValidationServiceMetrics {
            total_validations: m.total,
            successful_validations: m.successful,
            failed_validations: m.failed,
            average_duration_ms,
            uptime_secs: self.uptime().as_secs(),
            started_at: self.inner.started_at,
            cluster_metrics,
        }
    }

    /// Time since the service started.
    pub fn uptime(&self) -> Duration {
        self.inner.started_instant.elapsed()
    }
}

async fn run_validation_cycle(inner: &Arc<LiveInner>) -> EnhancedValidationResult {
    inner
        .bus
        .publish(Event::new("validation_started", serde_json::json!({})));

    let started = Instant::now();
    let result = inner.validator.validate(&inner.config).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    // History append + trim and metric updates are one critical section;
    // event dispatch happens after the lock is dropped.
    {
        let mut store = inner.store.lock().unwrap();

        store.history.push_back(HistoryEntry {
            timestamp: result.completed_at,
            duration_ms,
            result: result.clone(),
        });
        while store.history.len() > inner.settings.max_history_entries {
            store.history.pop_front();
        }

        store.metrics.total += 1;
        store.metrics.total_duration_ms += duration_ms;
        if result.valid {
            store.metrics.successful += 1;
        } else {
            store.metrics.failed += 1;
        }
        for (name, cluster) in &result.cluster_results {
            let entry = store.metrics.per_cluster.entry(name.clone()).or_default();
            entry.total += 1;
            entry.total_response_ms += cluster.metrics.total_ms;
            entry.last_check = Some(cluster.validated_at);
            if cluster.valid {
                entry.successful += 1;
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
            }
        }

        store.last = Some(result.clone());
    }

    let topic = if result.valid {
        "validation_completed"
    } else {
        "validation_failed"
    };
    inner.bus.publish(Event::new(
        topic,
        serde_json::json!({
            "valid": result.valid,
            "clusters": result.summary.total_clusters,
            "duration_ms": duration_ms,
        }),
    ));
    for (name, cluster) in &result.cluster_results {
        if !cluster.valid {
            inner.bus.publish(Event::new(
                "cluster_unreachable",
                serde_json::json!({"cluster": name, "errors": cluster.errors}),
            ));
        }
    }

    result
}

fn run_health_cycle(inner: &Arc<LiveInner>) {
    let health = {
        let store = inner.store.lock().unwrap();
        let m = &store.metrics;

        let clusters: BTreeMap<String, ClusterHealth> = match &store.last {
            Some(last) => last
                .cluster_results
                .iter()
                .map(|(name, r)| {
                    let stats = m.per_cluster.get(name);
                    let (availability, consecutive, avg_ms) = match stats {
                        Some(s) if s.total > 0 => (
                            s.successful as f64 / s.total as f64,
                            s.consecutive_failures,
                            s.total_response_ms as f64 / s.total as f64,
                        ),
                        _ => (0.0, 0, 0.0),
                    };
                    (
                        name.clone(),
                        ClusterHealth {
                            healthy: r.valid,
                            availability,
                            consecutive_errors: consecutive,
                            average_response_time_ms: avg_ms,
                            last_checked: r.validated_at,
                        },
                    )
                })
                .collect(),
            None => BTreeMap::new(),
        };

        let error_rate = if m.total > 0 {
            m.failed as f64 / m.total as f64
        } else {
            0.0
        };
        let service = ServiceHealth {
            healthy: error_rate < UNHEALTHY_ERROR_RATE,
            uptime_secs: inner.started_instant.elapsed().as_secs(),
            error_rate,
            total_validations: m.total,
        };

        HealthCheckResult {
            healthy: service.healthy && clusters.values().all(|c| c.healthy),
            timestamp: Utc::now(),
            clusters,
            service,
        }
    };

    let overall_healthy = health.healthy;
    inner.health.store(Some(Arc::new(health)));

    if !overall_healthy {
        inner.bus.publish(Event::new(
            "health_check_failed",
            serde_json::json!({"healthy": false}),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{
        AuthConfig, ClusterDescriptor, MultiClusterConfig, TokenAuth, ValidationConfig,
    };

    const GOOD_TOKEN: &str = "eyJhbGciOiJSUzI1NiJ9.ZXlKcGMzTWlP.c2lnbmF0dXJl";

    fn cluster(name: &str, token: &str) -> ClusterDescriptor {
        ClusterDescriptor {
            name: name.to_string(),
            endpoint: format!("https://api.{}.example.com:6443", name),
            auth: AuthConfig {
                method: "token".to_string(),
                token: Some(TokenAuth {
                    value: token.to_string(),
                    token_type: "bearer".to_string(),
                }),
                ..AuthConfig::default()
            },
            ..ClusterDescriptor::default()
        }
    }

    fn config(clusters: Vec<ClusterDescriptor>, cache_secs: u64) -> OrchestratorConfig {
        OrchestratorConfig {
            validation: ValidationConfig {
                cache_timeout_secs: cache_secs,
                ..ValidationConfig::default()
            },
            multi_cluster: MultiClusterConfig {
                enabled: true,
                clusters,
                ..MultiClusterConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }

    fn live(clusters: Vec<ClusterDescriptor>) -> LiveValidator {
        LiveValidator::new(config(clusters, 0), Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_no_state_before_first_cycle() {
        let live = live(vec![cluster("c1", GOOD_TOKEN)]);
        assert!(live.health().is_none());
        assert!(live.last_validation().is_none());
        assert!(live.history().is_empty());
        let summary = live.status_summary();
        assert!(summary.valid.is_none());
    }

    #[tokio::test]
    async fn test_validate_now_populates_store() {
        let live = live(vec![cluster("c1", GOOD_TOKEN)]);
        let result = live.validate_now().await;
        assert!(result.valid);

        assert!(live.last_validation().unwrap().valid);
        assert_eq!(live.history().len(), 1);
        let summary = live.status_summary();
        assert_eq!(summary.valid, Some(true));
        assert_eq!(summary.total_clusters, 1);

        let metrics = live.service_metrics();
        assert_eq!(metrics.total_validations, 1);
        assert_eq!(metrics.successful_validations, 1);
        assert_eq!(metrics.cluster_metrics["c1"].total_checks, 1);
        assert_eq!(metrics.cluster_metrics["c1"].availability, 1.0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut cfg = config(vec![cluster("c1", GOOD_TOKEN)], 0);
        cfg.live.max_history_entries = 3;
        let live = LiveValidator::new(cfg, Arc::new(EventBus::new()));

        for _ in 0..5 {
            live.validate_now().await;
        }
        let history = live.history();
        assert_eq!(history.len(), 3);
        // oldest entries were dropped: history is chronologically ordered
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        assert_eq!(live.service_metrics().total_validations, 5);
    }

    #[tokio::test]
    async fn test_invalid_cluster_tracks_consecutive_failures() {
        let live = live(vec![cluster("bad", "demo-token-123")]);
        live.validate_now().await;
        live.validate_now().await;

        let metrics = live.service_metrics();
        assert_eq!(metrics.failed_validations, 2);
        assert_eq!(metrics.cluster_metrics["bad"].consecutive_failures, 2);
        assert_eq!(metrics.cluster_metrics["bad"].availability, 0.0);
        assert!(live.cluster_result("bad").is_some());
        assert!(!live.cluster_result("bad").unwrap().valid);
        assert!(live.cluster_result("ghost").is_none());
    }

    #[tokio::test]
    async fn test_health_cycle_derives_from_last_validation() {
        let live = live(vec![cluster("c1", GOOD_TOKEN)]);
        live.validate_now().await;
        let health = live.refresh_health().unwrap();
        assert!(health.healthy);
        assert!(health.clusters["c1"].healthy);
        assert_eq!(health.clusters["c1"].availability, 1.0);
        assert!(health.service.healthy);
        assert_eq!(health.service.total_validations, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_when_error_rate_high() {
        let live = live(vec![cluster("bad", "demo-token-123")]);
        live.validate_now().await;
        let health = live.refresh_health().unwrap();
        assert!(!health.healthy);
        assert!(!health.clusters["bad"].healthy);
        // 1 failure out of 1 run: error rate 100%
        assert!(!health.service.healthy);
    }

    #[tokio::test]
    async fn test_events_emitted_on_cycle() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        for topic in [
            "validation_started",
            "validation_completed",
            "validation_failed",
            "cluster_unreachable",
        ] {
            let seen = seen.clone();
            bus.subscribe(
                topic,
                Arc::new(move |event: crate::events::Event| {
                    let seen = seen.clone();
                    Box::pin(async move {
                        seen.lock().unwrap().push(event.topic);
                        Ok(())
                    })
                }),
            );
        }

        let live = LiveValidator::new(
            config(vec![cluster("bad", "demo-token-123")], 0),
            bus.clone(),
        );
        live.validate_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"validation_started".to_string()));
        assert!(seen.contains(&"validation_failed".to_string()));
        assert!(seen.contains(&"cluster_unreachable".to_string()));
        assert!(!seen.contains(&"validation_completed".to_string()));
    }

    #[tokio::test]
    async fn test_start_stop_loops() {
        let mut cfg = config(vec![cluster("c1", GOOD_TOKEN)], 0);
        cfg.live.validation_interval_secs = 3600;
        cfg.live.health_check_interval_secs = 3600;
        let live = LiveValidator::new(cfg, Arc::new(EventBus::new()));
        live.start();
        tokio::time::timeout(Duration::from_secs(2), live.stop())
            .await
            .expect("stop should join promptly");
    }

    #[tokio::test]
    async fn test_uptime_is_monotonic() {
        let live = live(vec![cluster("c1", GOOD_TOKEN)]);
        let first = live.uptime();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(live.uptime() > first);
    }
}
