use crate::config::types::OrchestratorConfig;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

/// One finding, anchored to a config field path.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, value: impl fmt::Display, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {:?}: {}", self.field, self.value, self.message)
    }
}

/// Outcome of schema + cross-field validation over the full config tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: &str, value: impl fmt::Display, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(field, value, message));
    }

    fn warn(&mut self, field: &str, value: impl fmt::Display, message: impl Into<String>) {
        self.warnings
            .push(ValidationIssue::new(field, value, message));
    }

    /// The startup abort report: every field path, observed value, message.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.errors.is_empty() {
            out.push_str(&format!("{} error(s):\n", self.errors.len()));
            for e in &self.errors {
                out.push_str(&format!("  - {}\n", e));
            }
        }
        if !self.warnings.is_empty() {
            out.push_str(&format!("{} warning(s):\n", self.warnings.len()));
            for w in &self.warnings {
                out.push_str(&format!("  - {}\n", w));
            }
        }
        if out.is_empty() {
            out.push_str("configuration valid\n");
        }
        out
    }
}

fn semver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap())
}

fn bucket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$").unwrap())
}

fn dns_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap())
}

fn host_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9.-]+:\d{1,5}$").unwrap())
}

fn git_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(git@[A-Za-z0-9.-]+:[\w./-]+(\.git)?|https://[A-Za-z0-9.-]+/[\w./-]+(\.git)?)$")
            .unwrap()
    })
}

/// Is `name` a DNS label of at most 63 characters?
pub fn is_dns_label(name: &str) -> bool {
    name.len() <= 63 && dns_label_re().is_match(name)
}

/// Pure schema + cross-field validation over the whole config tree.
pub fn validate(cfg: &OrchestratorConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    validate_schema_version(cfg, &mut report);
    validate_storage(cfg, &mut report);
    validate_git(cfg, &mut report);
    validate_pipeline(cfg, &mut report);
    validate_backup(cfg, &mut report);
    validate_multi_cluster(cfg, &mut report);
    validate_cross_field(cfg, &mut report);

    report
}

fn validate_schema_version(cfg: &OrchestratorConfig, report: &mut ValidationReport) {
    if !semver_re().is_match(&cfg.schema_version) {
        report.error(
            "schema_version",
            &cfg.schema_version,
            "must be a semantic version (MAJOR.MINOR.PATCH)",
        );
    }
}

fn validate_storage(cfg: &OrchestratorConfig, report: &mut ValidationReport) {
    let s = &cfg.storage;

    match s.storage_type.as_str() {
        "minio" | "s3" => {}
        other => report.error("storage.type", other, "must be one of: minio, s3"),
    }

    if s.storage_type == "s3" && s.region.as_deref().map_or(true, str::is_empty) {
        report.error("storage.region", "", "region is required for s3 storage");
    }

    if !bucket_re().is_match(&s.bucket) {
        report.error(
            "storage.bucket",
            &s.bucket,
            "must match ^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$",
        );
    }

    if !is_endpoint(&s.endpoint) {
        report.error(
            "storage.endpoint",
            &s.endpoint,
            "must be host:port or a URL",
        );
    }
}

fn is_endpoint(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    if host_port_re().is_match(value) {
        return true;
    }
    reqwest::Url::parse(value).is_ok()
}

fn validate_git(cfg: &OrchestratorConfig, report: &mut ValidationReport) {
    if !cfg.git.repository.is_empty() && !git_url_re().is_match(&cfg.git.repository) {
        report.error(
            "git.repository",
            &cfg.git.repository,
            "must be an SSH (git@host:path) or HTTPS git URL",
        );
    }
    match cfg.git.auth_method.as_str() {
        "ssh" | "https" | "" => {}
        other => report.error("git.auth_method", other, "must be one of: ssh, https"),
    }
}

fn validate_pipeline(cfg: &OrchestratorConfig, report: &mut ValidationReport) {
    match cfg.pipeline.mode.as_str() {
        "sequential" | "parallel" | "manual" => {}
        other => report.error(
            "pipeline.mode",
            other,
            "must be one of: sequential, parallel, manual",
        ),
    }
}

fn validate_backup(cfg: &OrchestratorConfig, report: &mut ValidationReport) {
    let b = &cfg.backup;

    if b.batch_size < 1 || b.batch_size > 1000 {
        report.error(
            "backup.batch_size",
            b.batch_size,
            "must be in the range [1, 1000]",
        );
    }

    if b.retention_days > 365 {
        report.error(
            "backup.retention_days",
            b.retention_days,
            "must be in the range [0, 365]",
        );
    } else if b.retention_days == 0 {
        report.warn(
            "backup.retention_days",
            0,
            "retention of 0 days keeps backups forever",
        );
    }
}

fn validate_multi_cluster(cfg: &OrchestratorConfig, report: &mut ValidationReport) {
    let mc = &cfg.multi_cluster;
    if !mc.enabled {
        return;
    }

    match mc.mode.as_str() {
        "sequential" | "parallel" => {}
        other => report.error(
            "multi_cluster.mode",
            other,
            "must be one of: sequential, parallel",
        ),
    }

    if mc.clusters.is_empty() {
        report.error(
            "multi_cluster.clusters",
            "[]",
            "at least one cluster is required when multi-cluster is enabled",
        );
    }

    let mut seen = HashSet::new();
    for (i, c) in mc.clusters.iter().enumerate() {
        let field = format!("multi_cluster.clusters[{}]", i);

        if c.name.is_empty() {
            report.error(&format!("{}.name", field), "", "cluster name is required");
        } else {
            if !is_dns_label(&c.name) {
                report.error(
                    &format!("{}.name", field),
                    &c.name,
                    "must be a DNS label of at most 63 characters",
                );
            }
            if !seen.insert(c.name.clone()) {
                report.error(
                    &format!("{}.name", field),
                    &c.name,
                    "duplicate cluster name",
                );
            }
        }

        if c.endpoint.is_empty() {
            report.error(
                &format!("{}.endpoint", field),
                "",
                "cluster endpoint is required",
            );
        } else if !c.endpoint.starts_with("https://") {
            report.error(
                &format!("{}.endpoint", field),
                &c.endpoint,
                "cluster endpoint must use HTTPS",
            );
        }
    }

    if !mc.default_cluster.is_empty() && !seen.contains(&mc.default_cluster) {
        report.error(
            "multi_cluster.default_cluster",
            &mc.default_cluster,
            "does not name a configured cluster",
        );
    }

    let coord = &mc.coordination;
    if coord.timeout_secs == 0 {
        report.error(
            "multi_cluster.coordination.timeout_secs",
            0,
            "coordination timeout must be positive",
        );
    }
    if coord.retry_attempts > 10 {
        report.warn(
            "multi_cluster.coordination.retry_attempts",
            coord.retry_attempts,
            "more than 10 retries per cluster is rarely useful",
        );
    }
    if humantime::parse_duration(&coord.health_check_interval).is_err() {
        report.error(
            "multi_cluster.coordination.health_check_interval",
            &coord.health_check_interval,
            "must be a duration string such as \"30s\" or \"2m\"",
        );
    }

    let sched = &mc.scheduling;
    match sched.strategy.as_str() {
        "round_robin" | "least_loaded" | "priority" => {}
        other => report.error(
            "multi_cluster.scheduling.strategy",
            other,
            "must be one of: round_robin, least_loaded, priority",
        ),
    }
    if sched.max_concurrent_clusters == 0 {
        report.error(
            "multi_cluster.scheduling.max_concurrent_clusters",
            0,
            "must be at least 1",
        );
    }
    for (i, p) in sched.cluster_priorities.iter().enumerate() {
        if !seen.contains(&p.cluster) {
            report.warn(
                &format!("multi_cluster.scheduling.cluster_priorities[{}]", i),
                &p.cluster,
                "priority entry does not name a configured cluster",
            );
        }
    }
}

fn validate_cross_field(cfg: &OrchestratorConfig, report: &mut ValidationReport) {
    if cfg.argocd.enabled && cfg.git.repository.is_empty() {
        report.error(
            "git.repository",
            "",
            "a git repository is required when ArgoCD integration is enabled",
        );
    }

    if cfg.notifications.enabled && cfg.notifications.webhook_url.is_empty() {
        report.error(
            "notifications.webhook_url",
            "",
            "a webhook URL is required when notifications are enabled",
        );
    }

    if cfg.automation.enabled && cfg.automation.trigger_methods.is_empty() {
        report.error(
            "automation.trigger_methods",
            "[]",
            "at least one trigger method is required when automation is enabled",
        );
    }
}
