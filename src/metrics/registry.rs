use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for backup durations (seconds). Backups are
/// minutes-scale operations, probes are sub-second.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 180.0, 600.0, 1800.0, 3600.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the
/// `/metrics/prometheus` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** at startup before any
    /// `counter!` / `gauge!` / `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                DURATION_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // backup runs
        describe_counter!(
            "atlas_backup_runs_total",
            Unit::Count,
            "Per-cluster backup runs by terminal status"
        );
        describe_histogram!(
            "atlas_backup_duration_seconds",
            Unit::Seconds,
            "Per-cluster backup run duration"
        );
        describe_counter!(
            "atlas_multi_runs_total",
            Unit::Count,
            "Multi-cluster orchestrated runs by overall status"
        );

        // cluster health
        describe_gauge!(
            "atlas_cluster_healthy",
            Unit::Count,
            "Cluster liveness from the registry probe: 1=healthy 0=unhealthy"
        );

        // resilience
        describe_counter!(
            "atlas_breaker_rejected_total",
            Unit::Count,
            "Executor invocations rejected by an open circuit breaker"
        );
        describe_counter!(
            "atlas_retry_attempts_total",
            Unit::Count,
            "Retry attempts across all clusters"
        );

        // validation
        describe_counter!(
            "atlas_validation_runs_total",
            Unit::Count,
            "Enhanced validation passes by outcome"
        );

        // events
        describe_counter!(
            "atlas_events_published_total",
            Unit::Count,
            "Events published on the in-process bus"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
