use crate::auth::{AuthResolver, ResolvedClientConfig};
use crate::config::types::ClusterDescriptor;
use crate::error::BackupError;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on concurrent liveness probes per round.
const PROBE_CONCURRENCY: usize = 8;

/// Per-probe deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A registered cluster: immutable descriptor plus its resolved API client.
/// Health state lives in the registry's map and is mutated only by the
/// probe loop.
pub struct ClusterHandle {
    pub descriptor: Arc<ClusterDescriptor>,
    pub resolved: ResolvedClientConfig,
    pub client: reqwest::Client,
}

impl ClusterHandle {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Snapshot of a handle's probe state. Copied out on read.
#[derive(Debug, Clone, Copy)]
pub struct ProbeState {
    pub healthy: bool,
    pub last_probe: Option<DateTime<Utc>>,
}

/// Owns the set of cluster handles. Registration is all-or-nothing; `all()`
/// and `healthy()` preserve registration order.
pub struct ClusterRegistry {
    handles: Vec<Arc<ClusterHandle>>,
    index: HashMap<String, usize>,
    health: RwLock<HashMap<String, ProbeState>>,
    probe_interval: Duration,
    shutdown: CancellationToken,
}

impl ClusterRegistry {
    /// Validate and register every descriptor. A failure at any cluster
    /// fails the whole call; no partial registry is ever observable.
    pub async fn register(
        resolver: &AuthResolver,
        descriptors: &[ClusterDescriptor],
        probe_interval: Duration,
    ) -> Result<Self, BackupError> {
        let mut handles = Vec::with_capacity(descriptors.len());
        let mut index = HashMap::with_capacity(descriptors.len());
        let mut health = HashMap::with_capacity(descriptors.len());

        for desc in descriptors {
            resolver.validate_static(desc)?;
            let resolved = resolver.build_client_config(desc).await?;
            let client = resolver.build_http_client(&resolved)?;

            if index.contains_key(&desc.name) {
                return Err(BackupError::ConfigInvalid(format!(
                    "duplicate cluster name {:?}",
                    desc.name
                )));
            }

            index.insert(desc.name.clone(), handles.len());
            // Registration validated auth and TLS; a cluster starts healthy
            // until a probe says otherwise.
            health.insert(
                desc.name.clone(),
                ProbeState {
                    healthy: true,
                    last_probe: None,
                },
            );
            handles.push(Arc::new(ClusterHandle {
                descriptor: Arc::new(desc.clone()),
                resolved,
                client,
            }));
            info!("registry: cluster registered, name={}", desc.name);
        }

        Ok(Self {
            handles,
            index,
            health: RwLock::new(health),
            probe_interval,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn get(&self, name: &str) -> Result<Arc<ClusterHandle>, BackupError> {
        self.index
            .get(name)
            .map(|&i| self.handles[i].clone())
            .ok_or_else(|| BackupError::NotFound(format!("cluster {}", name)))
    }

    /// All handles, in registration order.
    pub fn all(&self) -> Vec<Arc<ClusterHandle>> {
        self.handles.clone()
    }

    /// Handles whose last probe (or registration default) was healthy,
    /// in registration order.
    pub fn healthy(&self) -> Vec<Arc<ClusterHandle>> {
        let health = self.health.read().unwrap();
        self.handles
            .iter()
            .filter(|h| health.get(h.name()).map_or(false, |s| s.healthy))
            .cloned()
            .collect()
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.health
            .read()
            .unwrap()
            .get(name)
            .map_or(false, |s| s.healthy)
    }

    pub fn probe_state(&self, name: &str) -> Option<ProbeState> {
        self.health.read().unwrap().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Background liveness loop: probe every handle each `probe_interval`
    /// until `close()` is called.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.probe_interval) => {}
                _ = self.shutdown.cancelled() => {
                    info!("registry: probe loop stopped");
                    return;
                }
            }
            self.probe_all().await;
            if self.shutdown.is_cancelled() {
                info!("registry: probe loop stopped");
                return;
            }
        }
    }

    /// Cancel the probe loop. Handles become unusable for scheduling once
    /// the owner drops the registry.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Single probe round, bounded by [`PROBE_CONCURRENCY`].
    pub async fn probe_all(&self) {
        let results: Vec<(String, bool)> = stream::iter(self.handles.iter().cloned())
            .map(|handle| async move {
                let healthy = probe_one(&handle).await;
                (handle.name().to_string(), healthy)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        let now = Utc::now();
        let mut health = self.health.write().unwrap();
        for (name, healthy) in results {
            let previous = health.get(&name).map(|s| s.healthy);
            health.insert(
                name.clone(),
                ProbeState {
                    healthy,
                    last_probe: Some(now),
                },
            );
            metrics::gauge!("atlas_cluster_healthy", "cluster" => name.clone())
                .set(if healthy { 1.0 } else { 0.0 });
            if previous != Some(healthy) {
                if healthy {
                    info!("registry: cluster recovered, name={}", name);
                } else {
                    warn!("registry: cluster unhealthy, name={}", name);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_health_for_test(&self, name: &str, healthy: bool) {
        let mut health = self.health.write().unwrap();
        if let Some(state) = health.get_mut(name) {
            state.healthy = healthy;
        }
    }
}

/// Minimal liveness probe: list namespaces with limit 1. A 403 means
/// authenticated but not authorized: the control plane is alive and the
/// credentials work, so it counts as healthy.
async fn probe_one(handle: &ClusterHandle) -> bool {
    let url = format!("{}/api/v1/namespaces?limit=1", handle.resolved.base_url);
    let request = handle.client.get(&url).timeout(PROBE_TIMEOUT).send();

    match request.await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let healthy = status == 200 || status == 403;
            debug!(
                "registry: probe, cluster={}, status={}, healthy={}",
                handle.name(),
                status,
                healthy
            );
            healthy
        }
        Err(e) => {
            debug!("registry: probe failed, cluster={}, error={}", handle.name(), e);
            false
        }
    }
}
