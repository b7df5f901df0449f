use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal and transitional states of a backup unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BackupStatus::Completed | BackupStatus::Failed | BackupStatus::Cancelled
        )
    }
}

/// Outcome of one cluster's backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterBackupResult {
    pub cluster_name: String,
    /// `"{cluster}-{unix_start}"`.
    pub backup_id: String,
    pub storage_location: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
    pub status: BackupStatus,
    pub namespace_count: u32,
    pub resource_count: u32,
    pub total_size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ClusterBackupResult {
    /// A fresh Running result at the start of a run.
    pub fn started(cluster_name: &str, storage_prefix: &str) -> Self {
        let start = Utc::now();
        Self {
            cluster_name: cluster_name.to_string(),
            backup_id: format!("{}-{}", cluster_name, start.timestamp()),
            storage_location: format!(
                "{}/{}",
                storage_prefix,
                start.format("%Y-%m-%d-%H-%M-%S")
            ),
            start_time: start,
            end_time: start,
            duration_secs: 0.0,
            status: BackupStatus::Running,
            namespace_count: 0,
            resource_count: 0,
            total_size_bytes: 0,
            compressed_size_bytes: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Close the result with a terminal status. A result cannot be
    /// `Completed` while it carries errors.
    pub fn finish(&mut self, status: BackupStatus) {
        debug_assert!(status.is_terminal());
        self.status = if status == BackupStatus::Completed && !self.errors.is_empty() {
            BackupStatus::Failed
        } else {
            status
        };
        self.end_time = Utc::now();
        self.duration_secs = (self.end_time - self.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
    }
}

/// Aggregated outcome of a multi-cluster run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiClusterBackupResult {
    pub total_clusters: u32,
    pub successful_clusters: u32,
    pub failed_clusters: u32,
    /// Keyed by cluster name; each value's `cluster_name` equals its key.
    pub cluster_results: BTreeMap<String, ClusterBackupResult>,
    pub overall_status: BackupStatus,
    /// "sequential" or "parallel".
    pub execution_mode: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
}

impl MultiClusterBackupResult {
    pub fn new(execution_mode: &str, total_clusters: u32) -> Self {
        let now = Utc::now();
        Self {
            total_clusters,
            successful_clusters: 0,
            failed_clusters: 0,
            cluster_results: BTreeMap::new(),
            overall_status: BackupStatus::Running,
            execution_mode: execution_mode.to_string(),
            start_time: now,
            end_time: now,
            duration_secs: 0.0,
        }
    }

    /// Record one cluster's outcome into the aggregate.
    pub fn record(&mut self, result: ClusterBackupResult) {
        if result.status == BackupStatus::Completed {
            self.successful_clusters += 1;
        } else {
            self.failed_clusters += 1;
        }
        self.cluster_results
            .insert(result.cluster_name.clone(), result);
    }

    /// Apply the overall-status rule: a run with no successes and at least
    /// one failure is Failed outright; otherwise Completed iff the failure
    /// count is within the threshold.
    pub fn finalize(&mut self, failure_threshold: u32) {
        self.overall_status = if self.successful_clusters == 0 && self.failed_clusters > 0 {
            BackupStatus::Failed
        } else if self.failed_clusters <= failure_threshold {
            BackupStatus::Completed
        } else {
            BackupStatus::Failed
        };
        self.end_time = Utc::now();
        self.duration_secs = (self.end_time - self.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
    }
}
