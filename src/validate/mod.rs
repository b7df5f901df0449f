pub mod cache;
pub mod enhanced;
pub mod types;

pub use cache::ValidationCache;
pub use enhanced::EnhancedValidator;
pub use types::{
    ClusterValidationResult, ConnectivityStatus, EnhancedValidationResult, PerformanceMetrics,
    TokenValidation, ValidationSummary,
};
