use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Deserialize a `T` that implements `Default` — treats `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Legacy single-cluster identity, kept for configs predating the
    /// multi-cluster block.
    #[serde(default)]
    pub cluster: ClusterIdentityConfig,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub argocd: ArgoCdConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub automation: AutomationConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Backup unit defaults; per-cluster overrides merge on top.
    #[serde(default)]
    pub backup: BackupExecutionConfig,

    #[serde(default)]
    pub multi_cluster: MultiClusterConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_schema_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "minio" or "s3".
    #[serde(rename = "type", default = "default_storage_type")]
    pub storage_type: String,

    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default)]
    pub use_ssl: bool,

    /// Required when `type` is "s3".
    #[serde(default)]
    pub region: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            endpoint: default_storage_endpoint(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: default_bucket(),
            use_ssl: false,
            region: None,
        }
    }
}

fn default_storage_type() -> String {
    "minio".to_string()
}

fn default_storage_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_bucket() -> String {
    "cluster-backups".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterIdentityConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub repository: String,

    #[serde(default = "default_git_branch")]
    pub branch: String,

    /// "ssh" or "https".
    #[serde(default = "default_git_auth_method")]
    pub auth_method: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repository: String::new(),
            branch: default_git_branch(),
            auth_method: default_git_auth_method(),
        }
    }
}

fn default_git_branch() -> String {
    "main".to_string()
}

fn default_git_auth_method() -> String {
    "ssh".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgoCdConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub trigger_methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// "sequential", "parallel", "manual".
    #[serde(default = "default_pipeline_mode")]
    pub mode: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: default_pipeline_mode(),
        }
    }
}

fn default_pipeline_mode() -> String {
    "sequential".to_string()
}

/// Per-cluster backup unit input. Used both as the global defaults block and,
/// after merging overrides, as the executor's resolved configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupExecutionConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub include_namespaces: Vec<String>,

    #[serde(default = "default_exclude_namespaces")]
    pub exclude_namespaces: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub include_resources: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub exclude_resources: Vec<String>,

    /// Days to keep backups; forwarded to the storage plane. 0 keeps forever.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Resources above this serialized size are skipped with a warning.
    #[serde(default = "default_max_resource_size")]
    pub max_resource_size_bytes: u64,

    /// API list page size.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Run the validate step after upload.
    #[serde(default = "default_true")]
    pub validate_after_upload: bool,

    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,

    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default)]
    pub encryption: bool,
}

impl Default for BackupExecutionConfig {
    fn default() -> Self {
        Self {
            include_namespaces: Vec::new(),
            exclude_namespaces: default_exclude_namespaces(),
            include_resources: Vec::new(),
            exclude_resources: Vec::new(),
            retention_days: default_retention_days(),
            max_resource_size_bytes: default_max_resource_size(),
            batch_size: default_batch_size(),
            validate_after_upload: true,
            storage_prefix: default_storage_prefix(),
            compression: true,
            encryption: false,
        }
    }
}

fn default_exclude_namespaces() -> Vec<String> {
    vec![
        "kube-system".to_string(),
        "kube-public".to_string(),
        "kube-node-lease".to_string(),
    ]
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_resource_size() -> u64 {
    10 * 1024 * 1024
}

fn default_batch_size() -> u32 {
    50
}

fn default_storage_prefix() -> String {
    "backups".to_string()
}

fn default_true() -> bool {
    true
}

/// Sparse per-cluster overrides; any `Some` field replaces the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupOverrides {
    #[serde(default)]
    pub include_namespaces: Option<Vec<String>>,

    #[serde(default)]
    pub exclude_namespaces: Option<Vec<String>>,

    #[serde(default)]
    pub include_resources: Option<Vec<String>>,

    #[serde(default)]
    pub exclude_resources: Option<Vec<String>>,

    #[serde(default)]
    pub retention_days: Option<u32>,

    #[serde(default)]
    pub max_resource_size_bytes: Option<u64>,

    #[serde(default)]
    pub batch_size: Option<u32>,

    #[serde(default)]
    pub validate_after_upload: Option<bool>,

    #[serde(default)]
    pub storage_prefix: Option<String>,

    #[serde(default)]
    pub compression: Option<bool>,

    #[serde(default)]
    pub encryption: Option<bool>,
}

impl BackupOverrides {
    /// Merge these overrides on top of the defaults.
    pub fn merged_with(&self, defaults: &BackupExecutionConfig) -> BackupExecutionConfig {
        BackupExecutionConfig {
            include_namespaces: self
                .include_namespaces
                .clone()
                .unwrap_or_else(|| defaults.include_namespaces.clone()),
            exclude_namespaces: self
                .exclude_namespaces
                .clone()
                .unwrap_or_else(|| defaults.exclude_namespaces.clone()),
            include_resources: self
                .include_resources
                .clone()
                .unwrap_or_else(|| defaults.include_resources.clone()),
            exclude_resources: self
                .exclude_resources
                .clone()
                .unwrap_or_else(|| defaults.exclude_resources.clone()),
            retention_days: self.retention_days.unwrap_or(defaults.retention_days),
            max_resource_size_bytes: self
                .max_resource_size_bytes
                .unwrap_or(defaults.max_resource_size_bytes),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            validate_after_upload: self
                .validate_after_upload
                .unwrap_or(defaults.validate_after_upload),
            storage_prefix: self
                .storage_prefix
                .clone()
                .unwrap_or_else(|| defaults.storage_prefix.clone()),
            compression: self.compression.unwrap_or(defaults.compression),
            encryption: self.encryption.unwrap_or(defaults.encryption),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiClusterConfig {
    #[serde(default)]
    pub enabled: bool,

    /// "sequential" or "parallel".
    #[serde(default = "default_execution_mode")]
    pub mode: String,

    #[serde(default)]
    pub default_cluster: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub clusters: Vec<ClusterDescriptor>,

    #[serde(default)]
    pub coordination: CoordinationConfig,

    #[serde(default)]
    pub scheduling: SchedulingConfig,
}

fn default_execution_mode() -> String {
    "sequential".to_string()
}

/// A target cluster. Constructed at config load and immutable for the
/// lifetime of a registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    /// DNS-label form, at most 63 characters.
    pub name: String,

    /// Must be an `https://` URL.
    pub endpoint: String,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Opaque storage descriptor forwarded to the backup unit.
    #[serde(default)]
    pub storage: ClusterStorageConfig,

    /// Legacy inline bearer token; honored only when `auth.method` is unset.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub backup: Option<BackupOverrides>,
}

impl ClusterDescriptor {
    /// The bearer token configured for this cluster, if any, respecting the
    /// legacy-token precedence rule.
    pub fn inline_token(&self) -> Option<&str> {
        if self.auth.method.is_empty() {
            return self.token.as_deref();
        }
        match self.auth.method.as_str() {
            "token" => self.auth.token.as_ref().map(|t| t.value.as_str()),
            "oidc" => self.auth.oidc.as_ref().and_then(|o| o.id_token.as_deref()),
            _ => None,
        }
    }

    /// Resolved backup unit configuration: defaults plus this cluster's
    /// overrides.
    pub fn execution_config(&self, defaults: &BackupExecutionConfig) -> BackupExecutionConfig {
        match &self.backup {
            Some(overrides) => overrides.merged_with(defaults),
            None => defaults.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// "token", "service_account", "oidc", "exec", or empty (legacy token).
    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub token: Option<TokenAuth>,

    #[serde(default)]
    pub service_account: Option<ServiceAccountAuth>,

    #[serde(default)]
    pub oidc: Option<OidcAuth>,

    #[serde(default)]
    pub exec: Option<ExecAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenAuth {
    #[serde(default)]
    pub value: String,

    /// "bearer" or "service_account_token"; both go on the wire as
    /// `Authorization: Bearer`.
    #[serde(rename = "type", default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountAuth {
    #[serde(default = "default_sa_token_path")]
    pub token_path: String,

    #[serde(default = "default_sa_ca_path")]
    pub ca_cert_path: String,
}

impl Default for ServiceAccountAuth {
    fn default() -> Self {
        Self {
            token_path: default_sa_token_path(),
            ca_cert_path: default_sa_ca_path(),
        }
    }
}

fn default_sa_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_sa_ca_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OidcAuth {
    #[serde(default)]
    pub issuer_url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub id_token: Option<String>,

    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecAuth {
    #[serde(default)]
    pub command: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// TLS material for the cluster API connection. Inline fields carry
/// base64-encoded PEM and take precedence over the path variants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Skip verification entirely; all other fields are ignored.
    #[serde(default)]
    pub insecure: bool,

    #[serde(default)]
    pub ca_data: Option<String>,

    #[serde(default)]
    pub ca_path: Option<String>,

    #[serde(default)]
    pub cert_data: Option<String>,

    #[serde(default)]
    pub cert_path: Option<String>,

    #[serde(default)]
    pub key_data: Option<String>,

    #[serde(default)]
    pub key_path: Option<String>,
}

impl TlsConfig {
    pub fn has_client_cert(&self) -> bool {
        self.cert_data.is_some() || self.cert_path.is_some()
    }

    pub fn has_client_key(&self) -> bool {
        self.key_data.is_some() || self.key_path.is_some()
    }
}

/// Opaque per-cluster object-store descriptor, forwarded to the backup unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterStorageConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub use_ssl: bool,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Top-level deadline for a full multi-cluster run, in seconds.
    #[serde(default = "default_coordination_timeout")]
    pub timeout_secs: u64,

    /// Retries per cluster on top of the first attempt.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Failed clusters tolerated before the run is reported Failed.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Registry probe cadence, as a humantime duration string ("30s", "2m").
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: String,

    #[serde(default)]
    pub retry: RetryTuning,

    #[serde(default)]
    pub circuit_breaker: BreakerTuning,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_coordination_timeout(),
            retry_attempts: default_retry_attempts(),
            failure_threshold: default_failure_threshold(),
            health_check_interval: default_health_check_interval(),
            retry: RetryTuning::default(),
            circuit_breaker: BreakerTuning::default(),
        }
    }
}

impl CoordinationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parsed probe interval; falls back to the default on an unparsable
    /// string (validation reports the bad value separately).
    pub fn probe_interval(&self) -> Duration {
        humantime::parse_duration(&self.health_check_interval)
            .unwrap_or_else(|_| Duration::from_secs(30))
    }
}

fn default_coordination_timeout() -> u64 {
    3600
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_failure_threshold() -> u32 {
    0
}

fn default_health_check_interval() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTuning {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Perturb each delay by up to ±25%.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerTuning {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,

    /// How long Open lasts before a half-open probe is admitted.
    #[serde(default = "default_breaker_reset")]
    pub reset_timeout_secs: u64,
}

impl Default for BreakerTuning {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            reset_timeout_secs: default_breaker_reset(),
        }
    }
}

impl BreakerTuning {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_reset() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// "round_robin", "least_loaded", "priority".
    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_clusters: usize,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub cluster_priorities: Vec<ClusterPriority>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_concurrent_clusters: default_max_concurrent(),
            cluster_priorities: Vec::new(),
        }
    }
}

impl SchedulingConfig {
    /// Lower value is more important; clusters absent from the list get
    /// [`UNKNOWN_PRIORITY`].
    pub fn priority_map(&self) -> HashMap<String, i32> {
        self.cluster_priorities
            .iter()
            .map(|p| (p.cluster.clone(), p.priority))
            .collect()
    }
}

/// Priority assigned to clusters missing from `cluster_priorities`.
pub const UNKNOWN_PRIORITY: i32 = 99;

fn default_strategy() -> String {
    "round_robin".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterPriority {
    pub cluster: String,
    pub priority: i32,
}

/// EnhancedValidator options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Probe TCP/TLS/API reachability per cluster.
    #[serde(default)]
    pub check_connectivity: bool,

    /// Probe the storage endpoint per cluster (failures are warnings).
    #[serde(default)]
    pub check_storage: bool,

    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            check_connectivity: false,
            check_storage: false,
            cache_timeout_secs: default_cache_timeout(),
            max_concurrent_checks: default_max_concurrent_checks(),
        }
    }
}

impl ValidationConfig {
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_secs)
    }
}

fn default_cache_timeout() -> u64 {
    300
}

fn default_max_concurrent_checks() -> usize {
    3
}

/// LiveValidator service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_validation_interval")]
    pub validation_interval_secs: u64,

    #[serde(default = "default_live_health_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_max_history")]
    pub max_history_entries: usize,

    /// API server bind address.
    #[serde(default = "default_live_listen")]
    pub listen: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            validation_interval_secs: default_validation_interval(),
            health_check_interval_secs: default_live_health_interval(),
            max_history_entries: default_max_history(),
            listen: default_live_listen(),
        }
    }
}

fn default_validation_interval() -> u64 {
    300
}

fn default_live_health_interval() -> u64 {
    60
}

fn default_max_history() -> usize {
    100
}

fn default_live_listen() -> String {
    "0.0.0.0:8090".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.schema_version, "1.0.0");
        assert_eq!(cfg.storage.storage_type, "minio");
        assert_eq!(cfg.storage.endpoint, "localhost:9000");
        assert_eq!(cfg.storage.bucket, "cluster-backups");
        assert!(!cfg.storage.use_ssl);
        assert!(cfg.storage.region.is_none());
        assert_eq!(cfg.git.branch, "main");
        assert_eq!(cfg.git.auth_method, "ssh");
        assert_eq!(cfg.pipeline.mode, "sequential");
        assert!(!cfg.multi_cluster.enabled);
        assert_eq!(cfg.observability.log_level, "info");
    }

    #[test]
    fn test_backup_defaults() {
        let b = BackupExecutionConfig::default();
        assert!(b.include_namespaces.is_empty());
        assert_eq!(
            b.exclude_namespaces,
            vec!["kube-system", "kube-public", "kube-node-lease"]
        );
        assert_eq!(b.retention_days, 30);
        assert_eq!(b.max_resource_size_bytes, 10 * 1024 * 1024);
        assert_eq!(b.batch_size, 50);
        assert!(b.validate_after_upload);
        assert_eq!(b.storage_prefix, "backups");
        assert!(b.compression);
        assert!(!b.encryption);
    }

    #[test]
    fn test_backup_overrides_merge() {
        let defaults = BackupExecutionConfig::default();
        let overrides = BackupOverrides {
            retention_days: Some(7),
            include_namespaces: Some(vec!["prod".to_string()]),
            compression: Some(false),
            ..BackupOverrides::default()
        };
        let merged = overrides.merged_with(&defaults);
        assert_eq!(merged.retention_days, 7);
        assert_eq!(merged.include_namespaces, vec!["prod"]);
        assert!(!merged.compression);
        // untouched fields come from defaults
        assert_eq!(merged.batch_size, 50);
        assert_eq!(merged.exclude_namespaces, defaults.exclude_namespaces);
    }

    #[test]
    fn test_execution_config_without_overrides() {
        let desc = ClusterDescriptor {
            name: "c1".to_string(),
            endpoint: "https://api.c1:6443".to_string(),
            ..ClusterDescriptor::default()
        };
        let defaults = BackupExecutionConfig::default();
        assert_eq!(desc.execution_config(&defaults), defaults);
    }

    #[test]
    fn test_cluster_descriptor_minimal() {
        let yaml = r#"
name: prod-east
endpoint: https://api.prod-east.example.com:6443
"#;
        let desc: ClusterDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.name, "prod-east");
        assert!(desc.auth.method.is_empty());
        assert!(!desc.tls.insecure);
        assert!(desc.token.is_none());
        assert!(desc.backup.is_none());
    }

    #[test]
    fn test_cluster_descriptor_full() {
        let yaml = r#"
name: prod-east
endpoint: https://api.prod-east.example.com:6443
auth:
  method: token
  token:
    value: eyJhbGciOiJSUzI1NiJ9.payload.sig
    type: bearer
tls:
  insecure: false
  ca_path: /etc/atlas/ca.crt
storage:
  endpoint: minio.example.com:9000
  bucket: prod-east-backups
  use_ssl: true
backup:
  retention_days: 14
  storage_prefix: prod-east
"#;
        let desc: ClusterDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.auth.method, "token");
        assert_eq!(desc.auth.token.as_ref().unwrap().token_type, "bearer");
        assert_eq!(desc.tls.ca_path.as_deref(), Some("/etc/atlas/ca.crt"));
        assert_eq!(desc.storage.bucket, "prod-east-backups");
        assert!(desc.storage.use_ssl);
        let b = desc.backup.as_ref().unwrap();
        assert_eq!(b.retention_days, Some(14));
        assert_eq!(b.storage_prefix.as_deref(), Some("prod-east"));
    }

    #[test]
    fn test_inline_token_legacy_precedence() {
        // No auth.method: the legacy token wins.
        let desc = ClusterDescriptor {
            name: "c".to_string(),
            endpoint: "https://c:6443".to_string(),
            token: Some("legacy-inline".to_string()),
            ..ClusterDescriptor::default()
        };
        assert_eq!(desc.inline_token(), Some("legacy-inline"));

        // auth.method set: the legacy token is ignored.
        let desc = ClusterDescriptor {
            auth: AuthConfig {
                method: "token".to_string(),
                token: Some(TokenAuth {
                    value: "structured".to_string(),
                    token_type: "bearer".to_string(),
                }),
                ..AuthConfig::default()
            },
            ..desc
        };
        assert_eq!(desc.inline_token(), Some("structured"));
    }

    #[test]
    fn test_inline_token_oidc() {
        let desc = ClusterDescriptor {
            name: "c".to_string(),
            endpoint: "https://c:6443".to_string(),
            auth: AuthConfig {
                method: "oidc".to_string(),
                oidc: Some(OidcAuth {
                    issuer_url: "https://issuer".to_string(),
                    client_id: "cid".to_string(),
                    id_token: Some("header.payload.sig".to_string()),
                    ..OidcAuth::default()
                }),
                ..AuthConfig::default()
            },
            ..ClusterDescriptor::default()
        };
        assert_eq!(desc.inline_token(), Some("header.payload.sig"));
    }

    #[test]
    fn test_service_account_defaults() {
        let sa = ServiceAccountAuth::default();
        assert_eq!(
            sa.token_path,
            "/var/run/secrets/kubernetes.io/serviceaccount/token"
        );
        assert_eq!(
            sa.ca_cert_path,
            "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"
        );
    }

    #[test]
    fn test_tls_client_material_flags() {
        let tls = TlsConfig {
            cert_data: Some("Y2VydA==".to_string()),
            ..TlsConfig::default()
        };
        assert!(tls.has_client_cert());
        assert!(!tls.has_client_key());
    }

    #[test]
    fn test_coordination_defaults() {
        let c = CoordinationConfig::default();
        assert_eq!(c.timeout_secs, 3600);
        assert_eq!(c.retry_attempts, 2);
        assert_eq!(c.failure_threshold, 0);
        assert_eq!(c.health_check_interval, "30s");
        assert_eq!(c.probe_interval(), Duration::from_secs(30));
        assert_eq!(c.retry.initial_delay_ms, 1000);
        assert_eq!(c.retry.max_delay_ms, 30_000);
        assert_eq!(c.retry.multiplier, 2.0);
        assert!(c.retry.jitter);
        assert_eq!(c.circuit_breaker.failure_threshold, 5);
        assert_eq!(c.circuit_breaker.reset_timeout_secs, 60);
    }

    #[test]
    fn test_probe_interval_parses_humantime() {
        let c = CoordinationConfig {
            health_check_interval: "2m".to_string(),
            ..CoordinationConfig::default()
        };
        assert_eq!(c.probe_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_probe_interval_bad_string_falls_back() {
        let c = CoordinationConfig {
            health_check_interval: "often".to_string(),
            ..CoordinationConfig::default()
        };
        assert_eq!(c.probe_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_scheduling_defaults_and_priority_map() {
        let s = SchedulingConfig::default();
        assert_eq!(s.strategy, "round_robin");
        assert_eq!(s.max_concurrent_clusters, 3);
        assert!(s.priority_map().is_empty());

        let s = SchedulingConfig {
            strategy: "priority".to_string(),
            cluster_priorities: vec![
                ClusterPriority {
                    cluster: "a".to_string(),
                    priority: 1,
                },
                ClusterPriority {
                    cluster: "b".to_string(),
                    priority: 2,
                },
            ],
            ..SchedulingConfig::default()
        };
        let map = s.priority_map();
        assert_eq!(map["a"], 1);
        assert_eq!(map["b"], 2);
        assert_eq!(UNKNOWN_PRIORITY, 99);
    }

    #[test]
    fn test_multi_cluster_block_yaml() {
        let yaml = r#"
enabled: true
mode: parallel
default_cluster: prod-east
clusters:
  - name: prod-east
    endpoint: https://api.prod-east:6443
  - name: prod-west
    endpoint: https://api.prod-west:6443
coordination:
  timeout_secs: 600
  retry_attempts: 1
  failure_threshold: 1
  health_check_interval: 45s
scheduling:
  strategy: priority
  max_concurrent_clusters: 2
  cluster_priorities:
    - cluster: prod-east
      priority: 1
    - cluster: prod-west
      priority: 2
"#;
        let mc: MultiClusterConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(mc.enabled);
        assert_eq!(mc.mode, "parallel");
        assert_eq!(mc.clusters.len(), 2);
        assert_eq!(mc.coordination.timeout_secs, 600);
        assert_eq!(mc.coordination.failure_threshold, 1);
        assert_eq!(mc.scheduling.max_concurrent_clusters, 2);
        assert_eq!(mc.scheduling.priority_map()["prod-west"], 2);
    }

    #[test]
    fn test_null_clusters_defaults_to_empty() {
        let json = r#"{"enabled": false, "clusters": null}"#;
        let mc: MultiClusterConfig = serde_json::from_str(json).unwrap();
        assert!(mc.clusters.is_empty());
    }

    #[test]
    fn test_null_trigger_methods_defaults_to_empty() {
        let json = r#"{"enabled": true, "trigger_methods": null}"#;
        let a: AutomationConfig = serde_json::from_str(json).unwrap();
        assert!(a.trigger_methods.is_empty());
    }

    #[test]
    fn test_validation_defaults() {
        let v = ValidationConfig::default();
        assert!(!v.check_connectivity);
        assert!(!v.check_storage);
        assert_eq!(v.cache_timeout(), Duration::from_secs(300));
        assert_eq!(v.max_concurrent_checks, 3);
    }

    #[test]
    fn test_live_defaults() {
        let l = LiveConfig::default();
        assert_eq!(l.validation_interval_secs, 300);
        assert_eq!(l.health_check_interval_secs, 60);
        assert_eq!(l.max_history_entries, 100);
        assert_eq!(l.listen, "0.0.0.0:8090");
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = OrchestratorConfig {
            schema_version: "1.2.0".to_string(),
            storage: StorageConfig {
                storage_type: "s3".to_string(),
                endpoint: "s3.us-east-1.amazonaws.com".to_string(),
                bucket: "atlas-prod".to_string(),
                region: Some("us-east-1".to_string()),
                use_ssl: true,
                ..StorageConfig::default()
            },
            multi_cluster: MultiClusterConfig {
                enabled: true,
                mode: "parallel".to_string(),
                clusters: vec![ClusterDescriptor {
                    name: "prod".to_string(),
                    endpoint: "https://api.prod:6443".to_string(),
                    ..ClusterDescriptor::default()
                }],
                ..MultiClusterConfig::default()
            },
            ..OrchestratorConfig::default()
        };

        let serialized = serde_yaml::to_string(&cfg).unwrap();
        let deserialized: OrchestratorConfig = serde_yaml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.schema_version, "1.2.0");
        assert_eq!(deserialized.storage.storage_type, "s3");
        assert_eq!(deserialized.storage.region.as_deref(), Some("us-east-1"));
        assert_eq!(deserialized.multi_cluster.clusters.len(), 1);
        assert_eq!(deserialized.multi_cluster.clusters[0].name, "prod");
    }

    #[test]
    fn test_exec_auth_yaml() {
        let yaml = r#"
command: aws-iam-authenticator
args: ["token", "-i", "prod"]
env:
  AWS_PROFILE: prod
"#;
        let exec: ExecAuth = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(exec.command, "aws-iam-authenticator");
        assert_eq!(exec.args.len(), 3);
        assert_eq!(exec.env["AWS_PROFILE"], "prod");
    }
}
