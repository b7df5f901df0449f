use crate::config::types::BackupExecutionConfig;
use crate::error::BackupError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// What one step contributed to the run.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub namespaces: u32,
    pub resources: u32,
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
    pub warnings: Vec<String>,
}

/// One named unit of work with a declared duration budget. The executor
/// enforces the budget and checks cancellation at every step boundary.
pub struct BackupStep {
    pub name: &'static str,
    pub budget: Duration,
    pub work: BoxFuture<'static, Result<StepReport, BackupError>>,
}

/// Inputs a provider needs to plan one run's step sequence.
#[derive(Debug, Clone)]
pub struct StepPlanRequest {
    pub cluster_name: String,
    pub config: BackupExecutionConfig,
    pub storage_location: String,
}

/// Produces the ordered step sequence for a single run. The default,
/// API-driven provider lives below; tests substitute scripted sequences.
pub trait StepProvider: Send + Sync {
    fn plan(&self, request: &StepPlanRequest) -> Vec<BackupStep>;
}

/// The contract boundary with the opaque backup unit: where serialized
/// snapshots go and how a stored snapshot is checked. Object-store
/// authentication and retention enforcement live behind this trait.
#[async_trait]
pub trait StoragePlane: Send + Sync {
    /// Store the archive at `location`; returns the stored byte count.
    async fn upload(
        &self,
        cluster: &str,
        location: &str,
        archive: &SnapshotArchive,
    ) -> Result<u64, BackupError>;

    /// Verify that a previously uploaded snapshot is present and intact.
    async fn validate(&self, cluster: &str, location: &str) -> Result<(), BackupError>;
}

/// A serialized (optionally gzip-compressed) snapshot plus its metadata.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    pub data: Vec<u8>,
    pub raw_size: u64,
    pub compressed: bool,
    pub namespace_count: u32,
    pub resource_count: u32,
    /// Retention window in days, forwarded untouched.
    pub retention_days: u32,
}

/// Storage plane writing archives under a local base directory. Object-store
/// planes (MinIO/S3) implement [`StoragePlane`] out of tree.
pub struct FsStoragePlane {
    base_dir: PathBuf,
}

impl FsStoragePlane {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn archive_path(&self, location: &str) -> PathBuf {
        self.base_dir.join(format!("{}.snapshot", location))
    }
}

#[async_trait]
impl StoragePlane for FsStoragePlane {
    async fn upload(
        &self,
        cluster: &str,
        location: &str,
        archive: &SnapshotArchive,
    ) -> Result<u64, BackupError> {
        let path = self.archive_path(location);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BackupError::NonRetryable(format!("creating {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&path, &archive.data)
            .await
            .map_err(|e| BackupError::NonRetryable(format!("writing {}: {}", path.display(), e)))?;
        debug!(
            "storage: archive written, cluster={}, path={}, bytes={}, retention_days={}",
            cluster,
            path.display(),
            archive.data.len(),
            archive.retention_days
        );
        Ok(archive.data.len() as u64)
    }

    async fn validate(&self, _cluster: &str, location: &str) -> Result<(), BackupError> {
        let path = self.archive_path(location);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| BackupError::NotFound(format!("snapshot {}", path.display())))?;
        if meta.len() == 0 {
            return Err(BackupError::NonRetryable(format!(
                "snapshot {} is empty",
                path.display()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Default API-driven step sequence.
// ---------------------------------------------------------------------------

/// Resource kinds the snapshot covers, with their API path prefixes.
const KIND_ROUTES: &[(&str, &str)] = &[
    ("configmaps", "/api/v1"),
    ("secrets", "/api/v1"),
    ("services", "/api/v1"),
    ("serviceaccounts", "/api/v1"),
    ("persistentvolumeclaims", "/api/v1"),
    ("deployments", "/apis/apps/v1"),
    ("statefulsets", "/apis/apps/v1"),
    ("daemonsets", "/apis/apps/v1"),
];

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// State threaded through the step futures of one run.
#[derive(Default)]
struct RunState {
    namespaces: Vec<String>,
    manifest: Vec<serde_json::Value>,
    raw_size: u64,
    archive: Option<SnapshotArchive>,
}

/// The production step sequence: discover namespaces → enumerate resources →
/// serialize + compress → upload → validate, all against the cluster's
/// resolved API client.
pub struct ApiStepProvider {
    client: reqwest::Client,
    base_url: String,
    plane: Arc<dyn StoragePlane>,
}

impl ApiStepProvider {
    pub fn new(client: reqwest::Client, base_url: String, plane: Arc<dyn StoragePlane>) -> Self {
        Self {
            client,
            base_url,
            plane,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, BackupError> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(
            Glob::new(p)
                .map_err(|e| BackupError::ConfigInvalid(format!("glob {:?}: {}", p, e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| BackupError::ConfigInvalid(format!("glob set: {}", e)))
}

fn selected(name: &str, include: &GlobSet, include_empty: bool, exclude: &GlobSet) -> bool {
    if exclude.is_match(name) {
        return false;
    }
    include_empty || include.is_match(name)
}

impl StepProvider for ApiStepProvider {
    fn plan(&self, request: &StepPlanRequest) -> Vec<BackupStep> {
        let state = Arc::new(Mutex::new(RunState::default()));
        let cfg = Arc::new(request.config.clone());
        let cluster = request.cluster_name.clone();
        let location = request.storage_location.clone();

        let mut steps = Vec::with_capacity(5);

        // 1. discover namespaces
        {
            let client = self.client.clone();
            let base = self.base_url.clone();
            let cfg = cfg.clone();
            let state = state.clone();
            steps.push(BackupStep {
                name: "discover_namespaces",
                budget: Duration::from_secs(60),
                work: Box::pin(async move {
                    let include = build_globset(&cfg.include_namespaces)?;
                    let exclude = build_globset(&cfg.exclude_namespaces)?;
                    let include_all = cfg.include_namespaces.is_empty();

                    let url = format!("{}/api/v1/namespaces?limit={}", base, cfg.batch_size);
                    let resp = client.get(&url).send().await?;
                    let resp = resp.error_for_status()?;
                    let list: ObjectList = resp.json().await?;

                    let names: Vec<String> = list
                        .items
                        .iter()
                        .filter_map(|item| {
                            item.pointer("/metadata/name")
                                .and_then(|v| v.as_str())
                                .map(str::to_string)
                        })
                        .filter(|name| selected(name, &include, include_all, &exclude))
                        .collect();

                    let mut report = StepReport {
                        namespaces: names.len() as u32,
                        ..StepReport::default()
                    };
                    if names.is_empty() {
                        report
                            .warnings
                            .push("no namespaces matched the include/exclude sets".to_string());
                    }
                    state.lock().unwrap().namespaces = names;
                    Ok(report)
                }),
            });
        }

        // 2. enumerate resources
        {
            let client = self.client.clone();
            let base = self.base_url.clone();
            let cfg = cfg.clone();
            let state = state.clone();
            steps.push(BackupStep {
                name: "enumerate_resources",
                budget: Duration::from_secs(300),
                work: Box::pin(async move {
                    let include = build_globset(&cfg.include_resources)?;
                    let exclude = build_globset(&cfg.exclude_resources)?;
                    let include_all = cfg.include_resources.is_empty();
                    let namespaces = state.lock().unwrap().namespaces.clone();

                    let mut report = StepReport::default();
                    let mut collected = Vec::new();

                    for ns in &namespaces {
                        for (kind, prefix) in KIND_ROUTES {
                            if !selected(kind, &include, include_all, &exclude) {
                                continue;
                            }
                            let url = format!(
                                "{}{}/namespaces/{}/{}?limit={}",
                                base, prefix, ns, kind, cfg.batch_size
                            );
                            let resp = client.get(&url).send().await?;
                            if !resp.status().is_success() {
                                report.warnings.push(format!(
                                    "listing {} in {}: HTTP {}",
                                    kind,
                                    ns,
                                    resp.status()
                                ));
                                continue;
                            }
                            let list: ObjectList = resp.json().await?;
                            for item in list.items {
                                let size = serde_json::to_vec(&item)
                                    .map(|b| b.len() as u64)
                                    .unwrap_or(0);
                                if size > cfg.max_resource_size_bytes {
                                    let name = item
                                        .pointer("/metadata/name")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or("<unnamed>");
                                    report.warnings.push(format!(
                                        "skipping {}/{} {} ({} bytes over cap)",
                                        ns, kind, name, size
                                    ));
                                    continue;
                                }
                                report.resources += 1;
                                report.raw_bytes += size;
                                collected.push(item);
                            }
                        }
                    }

                    let mut run = state.lock().unwrap();
                    run.manifest = collected;
                    run.raw_size = report.raw_bytes;
                    Ok(report)
                }),
            });
        }

        // 3. serialize + compress
        {
            let cfg = cfg.clone();
            let state = state.clone();
            steps.push(BackupStep {
                name: "serialize_snapshot",
                budget: Duration::from_secs(120),
                work: Box::pin(async move {
                    let (manifest, raw_size, namespace_count) = {
                        let run = state.lock().unwrap();
                        (
                            serde_json::Value::Array(run.manifest.clone()),
                            run.raw_size,
                            run.namespaces.len() as u32,
                        )
                    };
                    let resource_count = manifest.as_array().map(|a| a.len()).unwrap_or(0) as u32;

                    let raw = serde_json::to_vec(&manifest)
                        .map_err(|e| BackupError::Internal(format!("serializing snapshot: {}", e)))?;

                    let data = if cfg.compression {
                        let mut encoder =
                            async_compression::tokio::write::GzipEncoder::new(Cursor::new(
                                Vec::with_capacity(raw.len() / 4),
                            ));
                        encoder.write_all(&raw).await.map_err(|e| {
                            BackupError::Internal(format!("compressing snapshot: {}", e))
                        })?;
                        encoder.shutdown().await.map_err(|e| {
                            BackupError::Internal(format!("compressing snapshot: {}", e))
                        })?;
                        encoder.into_inner().into_inner()
                    } else {
                        raw.clone()
                    };

                    let report = StepReport {
                        raw_bytes: 0, // already counted during enumeration
                        compressed_bytes: data.len() as u64,
                        ..StepReport::default()
                    };
                    state.lock().unwrap().archive = Some(SnapshotArchive {
                        data,
                        raw_size,
                        compressed: cfg.compression,
                        namespace_count,
                        resource_count,
                        retention_days: cfg.retention_days,
                    });
                    Ok(report)
                }),
            });
        }

        // 4. upload
        {
            let plane = self.plane.clone();
            let state = state.clone();
            let cluster = cluster.clone();
            let location = location.clone();
            steps.push(BackupStep {
                name: "upload_snapshot",
                budget: Duration::from_secs(300),
                work: Box::pin(async move {
                    let archive = state
                        .lock()
                        .unwrap()
                        .archive
                        .clone()
                        .ok_or_else(|| BackupError::Internal("no archive to upload".into()))?;
                    let stored = plane.upload(&cluster, &location, &archive).await?;
                    debug!(
                        "backup: uploaded, cluster={}, location={}, bytes={}",
                        cluster, location, stored
                    );
                    Ok(StepReport::default())
                }),
            });
        }

        // 5. validate (flag-gated)
        if request.config.validate_after_upload {
            let plane = self.plane.clone();
            steps.push(BackupStep {
                name: "validate_snapshot",
                budget: Duration::from_secs(60),
                work: Box::pin(async move {
                    plane.validate(&cluster, &location).await?;
                    Ok(StepReport::default())
                }),
            });
        }

        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(bytes: &[u8]) -> SnapshotArchive {
        SnapshotArchive {
            data: bytes.to_vec(),
            raw_size: bytes.len() as u64,
            compressed: false,
            namespace_count: 1,
            resource_count: 1,
            retention_days: 30,
        }
    }

    fn temp_plane(tag: &str) -> (FsStoragePlane, PathBuf) {
        let dir = std::env::temp_dir().join(format!("atlas-plane-{}-{}", tag, std::process::id()));
        (FsStoragePlane::new(&dir), dir)
    }

    #[tokio::test]
    async fn test_fs_plane_upload_then_validate() {
        let (plane, dir) = temp_plane("ok");
        let stored = plane
            .upload("c1", "backups/2026-08-01-10-00-00", &archive(b"payload"))
            .await
            .unwrap();
        assert_eq!(stored, 7);
        plane
            .validate("c1", "backups/2026-08-01-10-00-00")
            .await
            .unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_fs_plane_validate_missing_is_not_found() {
        let (plane, dir) = temp_plane("missing");
        let err = plane.validate("c1", "backups/nope").await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_fs_plane_validate_empty_is_error() {
        let (plane, dir) = temp_plane("empty");
        plane
            .upload("c1", "backups/empty", &archive(b""))
            .await
            .unwrap();
        assert!(plane.validate("c1", "backups/empty").await.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_namespace_selection() {
        let include = build_globset(&["prod-*".to_string()]).unwrap();
        let exclude = build_globset(&["prod-sandbox".to_string()]).unwrap();
        assert!(selected("prod-east", &include, false, &exclude));
        assert!(!selected("staging", &include, false, &exclude));
        assert!(!selected("prod-sandbox", &include, false, &exclude));
        // empty include set matches everything not excluded
        let none = build_globset(&[]).unwrap();
        assert!(selected("anything", &none, true, &exclude));
    }

    #[test]
    fn test_bad_glob_is_config_invalid() {
        let err = build_globset(&["[".to_string()]).unwrap_err();
        assert!(matches!(err, BackupError::ConfigInvalid(_)));
    }

    #[test]
    fn test_api_provider_plans_full_sequence() {
        let provider = ApiStepProvider::new(
            reqwest::Client::new(),
            "https://api.test:6443".to_string(),
            Arc::new(FsStoragePlane::new("/tmp/atlas-unused")),
        );
        let request = StepPlanRequest {
            cluster_name: "c1".to_string(),
            config: BackupExecutionConfig::default(),
            storage_location: "backups/2026-08-01-10-00-00".to_string(),
        };
        let steps = provider.plan(&request);
        let names: Vec<_> = steps.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "discover_namespaces",
                "enumerate_resources",
                "serialize_snapshot",
                "upload_snapshot",
                "validate_snapshot"
            ]
        );
        assert!(steps.iter().all(|s| s.budget > Duration::ZERO));
    }

    #[test]
    fn test_validate_step_is_flag_gated() {
        let provider = ApiStepProvider::new(
            reqwest::Client::new(),
            "https://api.test:6443".to_string(),
            Arc::new(FsStoragePlane::new("/tmp/atlas-unused")),
        );
        let request = StepPlanRequest {
            cluster_name: "c1".to_string(),
            config: BackupExecutionConfig {
                validate_after_upload: false,
                ..BackupExecutionConfig::default()
            },
            storage_location: "backups/x".to_string(),
        };
        let steps = provider.plan(&request);
        assert!(steps.iter().all(|s| s.name != "validate_snapshot"));
    }
}
