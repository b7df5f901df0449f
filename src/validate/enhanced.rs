use crate::auth::AuthResolver;
use crate::config::types::{ClusterDescriptor, OrchestratorConfig, ValidationConfig};
use crate::config::validate as config_validate;
use crate::validate::cache::ValidationCache;
use crate::validate::types::{
    ClusterValidationResult, ConnectivityStatus, EnhancedValidationResult, TokenValidation,
};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// TCP dial budget for endpoint and storage probes.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Kubernetes API probe budget.
const API_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Substrings that mark a token as a demo/default credential.
const DEMO_TOKEN_PATTERNS: &[&str] = &[
    "demo", "test", "example", "default", "admin", "password", "123456",
];

/// Configuration validation plus live per-cluster probes: token validity,
/// TLS, API reachability, storage reachability, and cross-cluster conflict
/// checks. Per-cluster results are cached with a TTL.
pub struct EnhancedValidator {
    options: ValidationConfig,
    resolver: AuthResolver,
    cache: ValidationCache,
}

impl EnhancedValidator {
    pub fn new(options: &ValidationConfig) -> Self {
        Self {
            options: options.clone(),
            resolver: AuthResolver::new(),
            cache: ValidationCache::new(options.cache_timeout()),
        }
    }

    /// Cached per-cluster result, if fresh.
    pub fn get_cached(&self, cluster: &str) -> Option<ClusterValidationResult> {
        self.cache.get(cluster)
    }

    /// Run a full validation pass over the config tree.
    pub async fn validate(&self, cfg: &OrchestratorConfig) -> EnhancedValidationResult {
        let mut result = EnhancedValidationResult::new();
        let config_phase = Instant::now();

        // Phase 1: pure schema + cross-field validation.
        let report = config_validate::validate(cfg);
        result.global_errors = report.errors.iter().map(|i| i.to_string()).collect();
        result.global_warnings = report.warnings.iter().map(|i| i.to_string()).collect();
        result.config_phase_ms = config_phase.elapsed().as_millis() as u64;

        // Phase 2: per-cluster checks, bounded by max_concurrent_checks.
        let clusters = &cfg.multi_cluster.clusters;
        let per_cluster: Vec<ClusterValidationResult> = stream::iter(0..clusters.len())
            .map(|i| self.validate_cluster(&clusters[i], cfg))
            .buffer_unordered(self.options.max_concurrent_checks.max(1))
            .collect()
            .await;
        for cluster_result in per_cluster {
            result
                .cluster_results
                .insert(cluster_result.cluster_name.clone(), cluster_result);
        }

        // Phase 3: cross-cluster conflict checks.
        cross_cluster_checks(cfg, &mut result.global_warnings);

        result.finalize();
        metrics::counter!(
            "atlas_validation_runs_total",
            "result" => if result.valid { "valid" } else { "invalid" },
        )
        .increment(1);
        result
    }

    /// Validate one cluster, consulting the cache first.
    pub async fn validate_cluster(
        &self,
        desc: &ClusterDescriptor,
        cfg: &OrchestratorConfig,
    ) -> ClusterValidationResult {
        if let Some(cached) = self.cache.get(&desc.name) {
            debug!("validator: cache hit, cluster={}", desc.name);
            return cached;
        }

        let total = Instant::now();
        let mut result = ClusterValidationResult::new(&desc.name);

        // Stage 1: token validation.
        let token_phase = Instant::now();
        self.check_token(desc, &mut result);
        result.metrics.token_check_ms = token_phase.elapsed().as_millis() as u64;

        // Stage 2: cluster config checks.
        self.check_cluster_config(desc, &mut result);

        // Stage 3 + 4: connectivity and storage probes, flag-gated.
        if self.options.check_connectivity {
            let connectivity_phase = Instant::now();
            let mut status = self.probe_connectivity(desc, &mut result).await;
            if self.options.check_storage {
                status.storage_reachable =
                    Some(self.probe_storage(desc, cfg, &mut result).await);
            }
            result.connectivity = Some(status);
            result.metrics.connectivity_check_ms =
                connectivity_phase.elapsed().as_millis() as u64;
        } else if self.options.check_storage {
            let mut status = ConnectivityStatus::default();
            status.storage_reachable = Some(self.probe_storage(desc, cfg, &mut result).await);
            result.connectivity = Some(status);
        }

        result.metrics.total_ms = total.elapsed().as_millis() as u64;
        self.cache.put(result.clone());
        result
    }

    fn check_token(&self, desc: &ClusterDescriptor, result: &mut ClusterValidationResult) {
        let method = if desc.auth.method.is_empty() {
            "token".to_string()
        } else {
            desc.auth.method.clone()
        };
        let mut token = TokenValidation {
            valid: true,
            method: method.clone(),
            warnings: Vec::new(),
        };

        match desc.auth.method.as_str() {
            "" | "token" | "oidc" => {
                if let Some(value) = desc.inline_token() {
                    check_token_value(value, &mut token, result);
                } else if desc.auth.method != "oidc" {
                    token.valid = false;
                    result.error("no token configured");
                }
                if desc.auth.method == "oidc" {
                    self.check_oidc(desc, &mut token, result);
                }
            }
            "service_account" => match &desc.auth.service_account {
                Some(sa) if !sa.token_path.is_empty() => {
                    match std::fs::read_to_string(&sa.token_path) {
                        Ok(contents) if contents.trim().is_empty() => {
                            token.valid = false;
                            result.error(format!(
                                "service account token file {} is empty",
                                sa.token_path
                            ));
                        }
                        Ok(_) => {}
                        Err(_) => {
                            // Possibly running outside the pod.
                            let msg = format!(
                                "service account token file {} not found",
                                sa.token_path
                            );
                            token.warnings.push(msg.clone());
                            result.warn(msg);
                        }
                    }
                }
                _ => {
                    token.valid = false;
                    result.error("service account token path is not set");
                }
            },
            "exec" => match &desc.auth.exec {
                Some(exec) if !exec.command.is_empty() => {
                    if !command_resolvable(&exec.command) {
                        token.valid = false;
                        result.error(format!(
                            "exec command {:?} is not resolvable",
                            exec.command
                        ));
                    }
                }
                _ => {
                    token.valid = false;
                    result.error("exec command is not set");
                }
            },
            other => {
                token.valid = false;
                result.error(format!("unknown auth method {:?}", other));
            }
        }

        if !result.errors.is_empty() {
            token.valid = false;
        }
        result.token = Some(token);
    }

    fn check_oidc(
        &self,
        desc: &ClusterDescriptor,
        token: &mut TokenValidation,
        result: &mut ClusterValidationResult,
    ) {
        let Some(oidc) = &desc.auth.oidc else {
            token.valid = false;
            result.error("oidc block is required for the oidc auth method");
            return;
        };
        if reqwest::Url::parse(&oidc.issuer_url).is_err() {
            token.valid = false;
            result.error(format!("OIDC issuer URL {:?} is not a valid URL", oidc.issuer_url));
        }
        if oidc.client_id.is_empty() {
            token.valid = false;
            result.error("OIDC client id is required");
        }
        if oidc.id_token.is_none() && oidc.refresh_token.is_none() {
            token.valid = false;
            result.error("OIDC requires an id_token or a refresh_token");
        }
    }

    fn check_cluster_config(&self, desc: &ClusterDescriptor, result: &mut ClusterValidationResult) {
        if !desc.endpoint.starts_with("https://") {
            result.error(format!(
                "endpoint {} must use HTTPS",
                desc.endpoint
            ));
        }
        if !config_validate::is_dns_label(&desc.name) {
            result.warn(format!(
                "cluster name {:?} is not a DNS label",
                desc.name
            ));
        }
    }

    async fn probe_connectivity(
        &self,
        desc: &ClusterDescriptor,
        result: &mut ClusterValidationResult,
    ) -> ConnectivityStatus {
        let mut status = ConnectivityStatus::default();

        let Some((host, port)) = endpoint_host_port(&desc.endpoint) else {
            status.error = Some("endpoint is not a parsable URL".to_string());
            result.error("endpoint is not a parsable URL");
            return status;
        };

        // TCP dial.
        status.endpoint_reachable = dial(&host, port, DIAL_TIMEOUT).await;
        if !status.endpoint_reachable {
            let msg = format!("endpoint {}:{} is not reachable", host, port);
            status.error = Some(msg.clone());
            result.error(msg);
            return status;
        }

        // Resolved client for the TLS and API probes.
        let client = match self.resolver.build_client_config(desc).await {
            Ok(resolved) => match self.resolver.build_http_client(&resolved) {
                Ok(client) => client,
                Err(e) => {
                    result.error(format!("building probe client: {}", e));
                    return status;
                }
            },
            Err(e) => {
                result.error(format!("resolving auth: {}", e));
                return status;
            }
        };

        // TLS handshake probe, skipped for insecure clusters. Any HTTP
        // response means the handshake succeeded.
        if !desc.tls.insecure {
            let url = format!("{}/version", desc.endpoint.trim_end_matches('/'));
            match client.get(&url).timeout(DIAL_TIMEOUT).send().await {
                Ok(_) => status.tls_handshake_ok = Some(true),
                Err(e) => {
                    let msg = e.to_string();
                    status.tls_handshake_ok = Some(false);
                    let detail = format!("TLS handshake with {} failed: {}", host, msg);
                    status.error = Some(detail.clone());
                    result.error(detail);
                    return status;
                }
            }
        }

        // API reachability: list namespaces with limit 1. 200 or 403 means
        // the credentials authenticated (403 is authenticated but not
        // authorized).
        let url = format!(
            "{}/api/v1/namespaces?limit=1",
            desc.endpoint.trim_end_matches('/')
        );
        match client.get(&url).timeout(API_PROBE_TIMEOUT).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                status.api_reachable = true;
                status.auth_valid = code == 200 || code == 403;
                if !status.auth_valid {
                    result.error(format!("API probe returned HTTP {}", code));
                } else {
                    status.server_version = fetch_server_version(&client, &desc.endpoint).await;
                }
            }
            Err(e) => {
                status.api_reachable = false;
                let msg = format!("API probe failed: {}", e);
                status.error = Some(msg.clone());
                result.error(msg);
            }
        }

        status
    }

    /// Storage endpoint probe. Failures are warnings, never errors.
    async fn probe_storage(
        &self,
        desc: &ClusterDescriptor,
        cfg: &OrchestratorConfig,
        result: &mut ClusterValidationResult,
    ) -> bool {
        let endpoint = if desc.storage.endpoint.is_empty() {
            cfg.storage.endpoint.clone()
        } else {
            desc.storage.endpoint.clone()
        };
        let Some((host, port)) = storage_host_port(&endpoint) else {
            result.warn(format!("storage endpoint {:?} is not parsable", endpoint));
            return false;
        };
        let reachable = dial(&host, port, DIAL_TIMEOUT).await;
        if !reachable {
            result.warn(format!("storage endpoint {}:{} is not reachable", host, port));
        }
        reachable
    }
}

fn check_token_value(
    value: &str,
    token: &mut TokenValidation,
    result: &mut ClusterValidationResult,
) {
    if value.is_empty() {
        token.valid = false;
        result.error("token is empty");
        return;
    }
    if value.len() < 10 {
        token.valid = false;
        result.error("token is shorter than 10 characters");
    }
    if value.contains("${") {
        token.valid = false;
        result.error("token contains an unexpanded ${VAR} placeholder");
    }

    let lower = value.to_lowercase();
    if DEMO_TOKEN_PATTERNS.iter().any(|p| lower.contains(p)) {
        token.valid = false;
        result.error("token appears to be a demo or default token");
    }

    // Three dot-separated parts suggest a JWT; all parts must be non-empty.
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() == 3 && parts.iter().any(|p| p.is_empty()) {
        let msg = "token looks like a malformed JWT".to_string();
        token.warnings.push(msg.clone());
        result.warn(msg);
    }
}

fn command_resolvable(command: &str) -> bool {
    let path = Path::new(command);
    if path.is_absolute() || command.contains('/') {
        return path.exists();
    }
    let Ok(path_var) = std::env::var("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(command).exists())
}

/// Host and port of an `https://` endpoint; port defaults to 443.
fn endpoint_host_port(endpoint: &str) -> Option<(String, u16)> {
    let url = reqwest::Url::parse(endpoint).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default().unwrap_or(443);
    Some((host, port))
}

/// Storage endpoints come as `host:port` or a URL.
fn storage_host_port(endpoint: &str) -> Option<(String, u16)> {
    if endpoint.is_empty() {
        return None;
    }
    if endpoint.contains("://") {
        return endpoint_host_port(endpoint);
    }
    let (host, port) = endpoint.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

async fn dial(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

async fn fetch_server_version(client: &reqwest::Client, endpoint: &str) -> Option<String> {
    let url = format!("{}/version", endpoint.trim_end_matches('/'));
    let resp = client
        .get(&url)
        .timeout(DIAL_TIMEOUT)
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?;
    let body: serde_json::Value = resp.json().await.ok()?;
    body.get("gitVersion")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Fleet-wide conflict checks: shared storage buckets, shared endpoint
/// hosts, and degenerate priority distributions.
fn cross_cluster_checks(cfg: &OrchestratorConfig, warnings: &mut Vec<String>) {
    let clusters = &cfg.multi_cluster.clusters;
    if clusters.len() < 2 {
        return;
    }

    // Shared (storage endpoint, bucket) pairs.
    let mut by_bucket: HashMap<(String, String), Vec<&str>> = HashMap::new();
    for c in clusters {
        if !c.storage.endpoint.is_empty() && !c.storage.bucket.is_empty() {
            by_bucket
                .entry((c.storage.endpoint.clone(), c.storage.bucket.clone()))
                .or_default()
                .push(&c.name);
        }
    }
    for ((endpoint, bucket), names) in by_bucket {
        if names.len() > 1 {
            warnings.push(format!(
                "clusters {} share storage bucket {}/{}",
                names.join(", "),
                endpoint,
                bucket
            ));
        }
    }

    // Shared endpoint hosts.
    let mut by_host: HashMap<String, Vec<&str>> = HashMap::new();
    for c in clusters {
        if let Some((host, _)) = endpoint_host_port(&c.endpoint) {
            by_host.entry(host).or_default().push(&c.name);
        }
    }
    for (host, names) in by_host {
        if names.len() > 1 {
            warnings.push(format!(
                "clusters {} share the API endpoint host {}",
                names.join(", "),
                host
            ));
        }
    }

    // Under the priority strategy, one value held by more than half the
    // clusters defeats the point of prioritization.
    if cfg.multi_cluster.scheduling.strategy == "priority" {
        let mut counts: HashMap<i32, usize> = HashMap::new();
        for p in &cfg.multi_cluster.scheduling.cluster_priorities {
            *counts.entry(p.priority).or_default() += 1;
        }
        for (priority, count) in counts {
            if count * 2 > clusters.len() {
                warnings.push(format!(
                    "priority {} is assigned to {} of {} clusters",
                    priority,
                    count,
                    clusters.len()
                ));
            }
        }
    }
}
