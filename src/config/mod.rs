pub mod types;
pub mod validate;

pub use types::*;
pub use validate::{ValidationIssue, ValidationReport};

use anyhow::Result;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Expand `${VAR}` references from the process environment. Unset variables
/// are left as-is so the enhanced validator can flag them.
fn expand(value: &str) -> String {
    var_re()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

impl OrchestratorConfig {
    /// Load configuration: built-in defaults, then the file (if it exists),
    /// then environment overrides, then `${VAR}` expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: OrchestratorConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => {
                    anyhow::bail!("unsupported config format: .{ext}, use .yaml, .toml or .json")
                }
                None => anyhow::bail!("config file has no extension, use .yaml, .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            OrchestratorConfig::default()
        };

        config.apply_env_overrides();
        config.expand_vars();
        Ok(config)
    }

    /// Environment overrides. The recognized set is explicit; it is part of
    /// the crate's contract and of its test surface.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MINIO_ENDPOINT") {
            self.storage.endpoint = v;
        }
        if let Ok(v) = std::env::var("MINIO_ACCESS_KEY") {
            self.storage.access_key = v;
        }
        if let Ok(v) = std::env::var("MINIO_SECRET_KEY") {
            self.storage.secret_key = v;
        }
        if let Ok(v) = std::env::var("MINIO_BUCKET") {
            self.storage.bucket = v;
        }
        if let Ok(v) = std::env::var("MINIO_USE_SSL") {
            self.storage.use_ssl = v == "true";
        }

        if let Ok(v) = std::env::var("CLUSTER_NAME") {
            self.cluster.name = v;
        }
        if let Ok(v) = std::env::var("CLUSTER_DOMAIN") {
            self.cluster.domain = v;
        }

        if let Ok(v) = std::env::var("GIT_REPOSITORY") {
            self.git.repository = v;
        }
        if let Ok(v) = std::env::var("GIT_BRANCH") {
            self.git.branch = v;
        }
        if let Ok(v) = std::env::var("GIT_AUTH_METHOD") {
            self.git.auth_method = v;
        }

        if let Ok(v) = std::env::var("BATCH_SIZE") {
            if let Ok(n) = v.parse::<u32>() {
                self.backup.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("RETENTION_DAYS") {
            if let Ok(n) = v.parse::<u32>() {
                self.backup.retention_days = n;
            }
        }

        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.observability.log_level = v;
        }
    }

    /// `${VAR}` expansion over the explicit field list: storage credentials
    /// and location, git repository, and per-cluster endpoint/token
    /// material. Everything else is taken literally.
    pub fn expand_vars(&mut self) {
        self.storage.endpoint = expand(&self.storage.endpoint);
        self.storage.access_key = expand(&self.storage.access_key);
        self.storage.secret_key = expand(&self.storage.secret_key);
        self.storage.bucket = expand(&self.storage.bucket);
        self.git.repository = expand(&self.git.repository);

        for cluster in &mut self.multi_cluster.clusters {
            cluster.endpoint = expand(&cluster.endpoint);
            if let Some(token) = cluster.token.take() {
                cluster.token = Some(expand(&token));
            }
            if let Some(t) = cluster.auth.token.as_mut() {
                t.value = expand(&t.value);
            }
            if let Some(o) = cluster.auth.oidc.as_mut() {
                o.issuer_url = expand(&o.issuer_url);
                if let Some(id) = o.id_token.take() {
                    o.id_token = Some(expand(&id));
                }
                if let Some(rt) = o.refresh_token.take() {
                    o.refresh_token = Some(expand(&rt));
                }
            }
            cluster.storage.endpoint = expand(&cluster.storage.endpoint);
            cluster.storage.access_key = expand(&cluster.storage.access_key);
            cluster.storage.secret_key = expand(&cluster.storage.secret_key);
        }
    }
}
