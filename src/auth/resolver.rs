use crate::config::types::{ClusterDescriptor, TlsConfig};
use crate::error::BackupError;
use base64::Engine;
use reqwest::header;
use std::path::Path;
use std::time::Duration;

/// Default per-request timeout attached to every resolved client.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A descriptor resolved into ready-to-use client material: bearer token,
/// CA trust, client identity. Building the actual HTTP client is a separate
/// step so the validator can inspect the resolved material without one.
#[derive(Debug, Clone)]
pub struct ResolvedClientConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    /// PEM bytes for the trust anchor, when one is configured.
    pub ca_pem: Option<Vec<u8>>,
    /// Concatenated client cert + key PEM for mTLS, when configured.
    pub identity_pem: Option<Vec<u8>>,
    pub insecure: bool,
    pub timeout: Duration,
}

/// Turns a per-cluster auth descriptor into client configuration.
///
/// Dispatch by `auth.method`: token, service_account, oidc, exec. An empty
/// method falls back to the legacy inline token. No retries happen at this
/// layer; every failure is a typed validation error for the caller.
#[derive(Debug, Clone, Default)]
pub struct AuthResolver;

impl AuthResolver {
    pub fn new() -> Self {
        Self
    }

    /// Check required fields and file existence without touching the network.
    pub fn validate_static(&self, desc: &ClusterDescriptor) -> Result<(), BackupError> {
        if desc.endpoint.is_empty() {
            return Err(BackupError::InvalidAuth(format!(
                "cluster {}: endpoint is required",
                desc.name
            )));
        }

        match desc.auth.method.as_str() {
            "" => {
                if desc.token.as_deref().map_or(true, str::is_empty) {
                    return Err(BackupError::InvalidAuth(format!(
                        "cluster {}: no auth method and no legacy token",
                        desc.name
                    )));
                }
            }
            "token" => {
                let token = desc
                    .auth
                    .token
                    .as_ref()
                    .ok_or_else(|| missing(&desc.name, "auth.token"))?;
                if token.value.is_empty() {
                    return Err(BackupError::InvalidAuth(format!(
                        "cluster {}: token value is empty",
                        desc.name
                    )));
                }
                match token.token_type.as_str() {
                    "bearer" | "service_account_token" => {}
                    other => {
                        return Err(BackupError::InvalidAuth(format!(
                            "cluster {}: unknown token type {:?}",
                            desc.name, other
                        )))
                    }
                }
            }
            "service_account" => {
                let sa = desc
                    .auth
                    .service_account
                    .as_ref()
                    .ok_or_else(|| missing(&desc.name, "auth.service_account"))?;
                if sa.token_path.is_empty() {
                    return Err(BackupError::InvalidAuth(format!(
                        "cluster {}: service account token path is empty",
                        desc.name
                    )));
                }
                if !Path::new(&sa.token_path).exists() {
                    return Err(BackupError::NotFound(format!(
                        "cluster {}: service account token file {}",
                        desc.name, sa.token_path
                    )));
                }
                if !sa.ca_cert_path.is_empty() && !Path::new(&sa.ca_cert_path).exists() {
                    return Err(BackupError::NotFound(format!(
                        "cluster {}: service account CA file {}",
                        desc.name, sa.ca_cert_path
                    )));
                }
            }
            "oidc" => {
                let oidc = desc
                    .auth
                    .oidc
                    .as_ref()
                    .ok_or_else(|| missing(&desc.name, "auth.oidc"))?;
                if oidc.issuer_url.is_empty() || oidc.client_id.is_empty() {
                    return Err(BackupError::InvalidAuth(format!(
                        "cluster {}: OIDC requires issuer_url and client_id",
                        desc.name
                    )));
                }
                if oidc.id_token.is_none() && oidc.refresh_token.is_none() {
                    return Err(BackupError::InvalidAuth(format!(
                        "cluster {}: OIDC requires an id_token or a refresh_token",
                        desc.name
                    )));
                }
            }
            "exec" => {
                let exec = desc
                    .auth
                    .exec
                    .as_ref()
                    .ok_or_else(|| missing(&desc.name, "auth.exec"))?;
                if exec.command.is_empty() {
                    return Err(BackupError::InvalidAuth(format!(
                        "cluster {}: exec command is empty",
                        desc.name
                    )));
                }
            }
            other => {
                return Err(BackupError::InvalidAuth(format!(
                    "cluster {}: unknown auth method {:?}",
                    desc.name, other
                )))
            }
        }

        self.validate_tls_static(&desc.name, &desc.tls)
    }

    fn validate_tls_static(&self, cluster: &str, tls: &TlsConfig) -> Result<(), BackupError> {
        if tls.insecure {
            return Ok(());
        }
        if tls.has_client_cert() != tls.has_client_key() {
            return Err(BackupError::InvalidTls(format!(
                "cluster {}: client certificate and key must both be set",
                cluster
            )));
        }
        for path in [&tls.ca_path, &tls.cert_path, &tls.key_path]
            .into_iter()
            .flatten()
        {
            if !Path::new(path).exists() {
                return Err(BackupError::NotFound(format!(
                    "cluster {}: TLS file {}",
                    cluster, path
                )));
            }
        }
        Ok(())
    }

    /// Resolve the descriptor into client material. Reads token files and
    /// runs exec plugins, but performs no network I/O.
    pub async fn build_client_config(
        &self,
        desc: &ClusterDescriptor,
    ) -> Result<ResolvedClientConfig, BackupError> {
        let bearer_token = self.resolve_bearer(desc).await?;
        let (ca_pem, identity_pem) = self.resolve_tls(desc)?;

        Ok(ResolvedClientConfig {
            base_url: desc.endpoint.trim_end_matches('/').to_string(),
            bearer_token,
            ca_pem,
            identity_pem,
            insecure: desc.tls.insecure,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    async fn resolve_bearer(&self, desc: &ClusterDescriptor) -> Result<Option<String>, BackupError> {
        match desc.auth.method.as_str() {
            "" => Ok(desc.token.clone()),
            "token" => Ok(desc.auth.token.as_ref().map(|t| t.value.clone())),
            "service_account" => {
                let sa = desc
                    .auth
                    .service_account
                    .as_ref()
                    .ok_or_else(|| missing(&desc.name, "auth.service_account"))?;
                let token = std::fs::read_to_string(&sa.token_path).map_err(|e| {
                    BackupError::NotFound(format!(
                        "cluster {}: reading {}: {}",
                        desc.name, sa.token_path, e
                    ))
                })?;
                Ok(Some(token.trim().to_string()))
            }
            "oidc" => {
                let oidc = desc
                    .auth
                    .oidc
                    .as_ref()
                    .ok_or_else(|| missing(&desc.name, "auth.oidc"))?;
                // Refresh-token rotation is an extension point; the id token
                // is what goes on the wire.
                match &oidc.id_token {
                    Some(id) => Ok(Some(id.clone())),
                    None => Err(BackupError::InvalidAuth(format!(
                        "cluster {}: OIDC id_token is required to build a client",
                        desc.name
                    ))),
                }
            }
            "exec" => {
                let exec = desc
                    .auth
                    .exec
                    .as_ref()
                    .ok_or_else(|| missing(&desc.name, "auth.exec"))?;
                let mut cmd = tokio::process::Command::new(&exec.command);
                cmd.args(&exec.args);
                for (k, v) in &exec.env {
                    cmd.env(k, v);
                }
                let output = cmd.output().await.map_err(|e| {
                    BackupError::ExecFailure(format!(
                        "cluster {}: running {}: {}",
                        desc.name, exec.command, e
                    ))
                })?;
                if !output.status.success() {
                    return Err(BackupError::ExecFailure(format!(
                        "cluster {}: {} exited with {}: {}",
                        desc.name,
                        exec.command,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if token.is_empty() {
                    return Err(BackupError::ExecFailure(format!(
                        "cluster {}: {} produced no output",
                        desc.name, exec.command
                    )));
                }
                Ok(Some(token))
            }
            other => Err(BackupError::InvalidAuth(format!(
                "cluster {}: unknown auth method {:?}",
                desc.name, other
            ))),
        }
    }

    /// TLS composition. `insecure` wins over everything; otherwise inline
    /// base64 data takes precedence over file paths, for the CA and the
    /// client pair alike.
    fn resolve_tls(
        &self,
        desc: &ClusterDescriptor,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), BackupError> {
        let tls = &desc.tls;
        if tls.insecure {
            return Ok((None, None));
        }

        let mut ca_pem = load_material(&desc.name, "ca", &tls.ca_data, &tls.ca_path)?;
        // A service-account CA path is trust input when the TLS block has none.
        if ca_pem.is_none() && desc.auth.method == "service_account" {
            if let Some(sa) = &desc.auth.service_account {
                if !sa.ca_cert_path.is_empty() && Path::new(&sa.ca_cert_path).exists() {
                    ca_pem = Some(std::fs::read(&sa.ca_cert_path).map_err(|e| {
                        BackupError::InvalidTls(format!(
                            "cluster {}: reading {}: {}",
                            desc.name, sa.ca_cert_path, e
                        ))
                    })?);
                }
            }
        }

        let cert_pem = load_material(&desc.name, "client cert", &tls.cert_data, &tls.cert_path)?;
        let key_pem = load_material(&desc.name, "client key", &tls.key_data, &tls.key_path)?;

        let identity_pem = match (cert_pem, key_pem) {
            (Some(mut cert), Some(key)) => {
                cert.push(b'\n');
                cert.extend_from_slice(&key);
                Some(cert)
            }
            (None, None) => None,
            _ => {
                return Err(BackupError::InvalidTls(format!(
                    "cluster {}: client certificate and key must both be set",
                    desc.name
                )))
            }
        };

        Ok((ca_pem, identity_pem))
    }

    /// Build the authenticated HTTP client from resolved material.
    pub fn build_http_client(
        &self,
        resolved: &ResolvedClientConfig,
    ) -> Result<reqwest::Client, BackupError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = &resolved.bearer_token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| BackupError::InvalidAuth(format!("invalid bearer token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(resolved.timeout)
            .connect_timeout(Duration::from_secs(5))
            .default_headers(headers);

        if resolved.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = &resolved.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca)
                .map_err(|e| BackupError::InvalidTls(format!("CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity) = &resolved.identity_pem {
            let identity = reqwest::Identity::from_pem(identity)
                .map_err(|e| BackupError::InvalidTls(format!("client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| BackupError::Internal(format!("building HTTP client: {}", e)))
    }
}

fn missing(cluster: &str, field: &str) -> BackupError {
    BackupError::InvalidAuth(format!("cluster {}: {} block is required", cluster, field))
}

/// Inline base64 data beats the file path; either source yields PEM bytes.
fn load_material(
    cluster: &str,
    what: &str,
    data: &Option<String>,
    path: &Option<String>,
) -> Result<Option<Vec<u8>>, BackupError> {
    if let Some(encoded) = data {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| {
                BackupError::InvalidTls(format!("cluster {}: {} base64: {}", cluster, what, e))
            })?;
        return Ok(Some(decoded));
    }
    if let Some(path) = path {
        let bytes = std::fs::read(path).map_err(|e| {
            BackupError::InvalidTls(format!("cluster {}: reading {} {}: {}", cluster, what, path, e))
        })?;
        return Ok(Some(bytes));
    }
    Ok(None)
}
