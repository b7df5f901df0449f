pub mod api;
pub mod service;

pub use service::{
    ClusterHealth, HealthCheckResult, HistoryEntry, LiveValidator, ServiceHealth, StatusSummary,
    ValidationServiceMetrics,
};
