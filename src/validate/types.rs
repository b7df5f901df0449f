use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Live probe results for one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    /// TCP dial to the API endpoint host succeeded.
    pub endpoint_reachable: bool,

    /// TLS handshake with the endpoint hostname succeeded. `None` when the
    /// cluster is configured insecure and the probe was skipped.
    pub tls_handshake_ok: Option<bool>,

    /// The Kubernetes API answered the namespaces probe.
    pub api_reachable: bool,

    /// HTTP 200 or 403 from the API: the credentials authenticated, even
    /// if not authorized for the probe resource.
    pub auth_valid: bool,

    /// TCP dial to the storage endpoint, when that check is enabled.
    pub storage_reachable: Option<bool>,

    /// Server version reported by the cluster, when reachable.
    pub server_version: Option<String>,

    pub error: Option<String>,
}

/// Static token inspection result for one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    pub method: String,
    pub warnings: Vec<String>,
}

/// Time spent in each validation stage for one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub token_check_ms: u64,
    pub connectivity_check_ms: u64,
    pub total_ms: u64,
}

/// Per-cluster outcome of enhanced validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterValidationResult {
    pub cluster_name: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub connectivity: Option<ConnectivityStatus>,
    pub token: Option<TokenValidation>,
    pub metrics: PerformanceMetrics,
    pub validated_at: DateTime<Utc>,
}

impl ClusterValidationResult {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            connectivity: None,
            token: None,
            metrics: PerformanceMetrics::default(),
            validated_at: Utc::now(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.valid = false;
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Counts over a full validation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_clusters: u32,
    pub valid_clusters: u32,
    pub invalid_clusters: u32,
    pub total_errors: u32,
    pub total_warnings: u32,
}

/// Outcome of one full enhanced-validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedValidationResult {
    pub valid: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Time spent in the pure configuration phase.
    pub config_phase_ms: u64,
    pub cluster_results: BTreeMap<String, ClusterValidationResult>,
    pub global_errors: Vec<String>,
    pub global_warnings: Vec<String>,
    pub summary: ValidationSummary,
}

impl EnhancedValidationResult {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            valid: true,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            config_phase_ms: 0,
            cluster_results: BTreeMap::new(),
            global_errors: Vec::new(),
            global_warnings: Vec::new(),
            summary: ValidationSummary::default(),
        }
    }

    /// Close the result: compute validity, the summary, and the window.
    pub fn finalize(&mut self) {
        let mut summary = ValidationSummary {
            total_clusters: self.cluster_results.len() as u32,
            total_errors: self.global_errors.len() as u32,
            total_warnings: self.global_warnings.len() as u32,
            ..ValidationSummary::default()
        };
        for result in self.cluster_results.values() {
            if result.valid {
                summary.valid_clusters += 1;
            } else {
                summary.invalid_clusters += 1;
            }
            summary.total_errors += result.errors.len() as u32;
            summary.total_warnings += result.warnings.len() as u32;
        }
        self.valid = self.global_errors.is_empty() && summary.invalid_clusters == 0;
        self.summary = summary;
        self.completed_at = Utc::now();
        self.duration_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
    }
}

impl Default for EnhancedValidationResult {
    fn default() -> Self {
        Self::new()
    }
}
