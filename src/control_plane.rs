//! Control plane policy store and the proxy-side policy cache.
//!
//! [`ControlPlane`] versions every applied policy with a single monotonic
//! counter and publishes immutable snapshots: a writer builds a new map and
//! swaps the `Arc`, so readers never observe a partial update.
//!
//! [`PolicyCache`] is what a proxy reads on the hot path. It holds read-only
//! copies refreshed from a [`PolicySource`] by polling or push notification,
//! and tolerates being a version or more behind.

use crate::error::PolicyError;
use crate::policy::MeshPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::StatusCode;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use url::Url;

/// A policy together with the version at which it was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedPolicy {
    pub version: u64,
    pub policy: MeshPolicy,
}

/// Immutable view of every stored policy.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    pub version: u64,
    pub policies: HashMap<String, Arc<VersionedPolicy>>,
}

/// Versioned, copy-on-write policy store.
pub struct ControlPlane {
    current: RwLock<Arc<PolicySnapshot>>,
    notify: watch::Sender<u64>,
}

impl ControlPlane {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(PolicySnapshot::default())),
            notify,
        }
    }

    /// Validates, versions and stores a policy. Returns the new version.
    pub fn apply_policy(&self, service_id: &str, policy: MeshPolicy) -> Result<u64, PolicyError> {
        policy.validate()?;

        let version = {
            let mut current = self.current.write();
            let version = current.version + 1;
            let mut policies = current.policies.clone();
            policies.insert(
                service_id.to_string(),
                Arc::new(VersionedPolicy { version, policy }),
            );
            *current = Arc::new(PolicySnapshot { version, policies });
            version
        };

        info!(service_id = %service_id, version, "policy applied");
        self.notify.send_replace(version);
        Ok(version)
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    /// Latest global policy version; 0 before any policy was applied.
    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Returns the service's policy, or the default one if none was applied.
    pub fn get_policy(&self, service_id: &str) -> MeshPolicy {
        self.get_versioned(service_id)
            .map(|v| v.policy.clone())
            .unwrap_or_default()
    }

    /// Returns the stored policy with its version.
    pub fn get_versioned(&self, service_id: &str) -> Option<Arc<VersionedPolicy>> {
        self.snapshot().policies.get(service_id).cloned()
    }

    /// Returns the service's policy only if it is newer than `since_version`.
    pub fn get_policy_since(
        &self,
        service_id: &str,
        since_version: u64,
    ) -> Option<Arc<VersionedPolicy>> {
        self.get_versioned(service_id)
            .filter(|v| v.version > since_version)
    }

    /// Push channel carrying the latest global version.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a proxy fetches policies from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Returns the service's policy if newer than `since_version`.
    async fn fetch(
        &self,
        service_id: &str,
        since_version: u64,
    ) -> Result<Option<VersionedPolicy>, PolicyError>;
}

#[async_trait]
impl PolicySource for ControlPlane {
    async fn fetch(
        &self,
        service_id: &str,
        since_version: u64,
    ) -> Result<Option<VersionedPolicy>, PolicyError> {
        Ok(self
            .get_policy_since(service_id, since_version)
            .map(|v| v.as_ref().clone()))
    }
}

/// Polls a remote control plane over `GET /policy/{service}?since_version=N`.
pub struct HttpPolicySource {
    base: Url,
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl HttpPolicySource {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, PolicyError> {
        let base = Url::parse(base)
            .map_err(|e| PolicyError::Unavailable(format!("invalid control plane url: {}", e)))?;
        Ok(Self {
            base,
            client: Client::builder(TokioExecutor::new()).build_http(),
            timeout,
        })
    }

    fn policy_uri(&self, service_id: &str, since_version: u64) -> Result<http::Uri, PolicyError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PolicyError::Unavailable("control plane url cannot be a base".to_string()))?
            .pop_if_empty()
            .push("policy")
            .push(service_id);
        url.query_pairs_mut()
            .append_pair("since_version", &since_version.to_string());
        url.as_str()
            .parse()
            .map_err(|e| PolicyError::Unavailable(format!("invalid policy uri: {}", e)))
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch(
        &self,
        service_id: &str,
        since_version: u64,
    ) -> Result<Option<VersionedPolicy>, PolicyError> {
        let uri = self.policy_uri(service_id, since_version)?;
        let response = tokio::time::timeout(self.timeout, self.client.get(uri))
            .await
            .map_err(|_| PolicyError::Unavailable("control plane request timed out".to_string()))?
            .map_err(|e| PolicyError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => {
                let body = response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| PolicyError::Unavailable(e.to_string()))?
                    .to_bytes();
                let policy = serde_json::from_slice(&body)
                    .map_err(|e| PolicyError::Unavailable(format!("bad policy payload: {}", e)))?;
                Ok(Some(policy))
            }
            status => Err(PolicyError::Unavailable(format!(
                "control plane returned {}",
                status
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedPolicy {
    /// 0 while only the default policy is known.
    version: u64,
    policy: Arc<MeshPolicy>,
}

/// Proxy-side read-only policy copies.
pub struct PolicyCache {
    source: Arc<dyn PolicySource>,
    entries: DashMap<String, CachedPolicy>,
    refresh_interval: Duration,
}

impl PolicyCache {
    pub fn new(source: Arc<dyn PolicySource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            entries: DashMap::new(),
            refresh_interval,
        }
    }

    /// Returns the cached policy of a service.
    ///
    /// The first read of a service fetches it once; afterwards only the
    /// background refresh talks to the source. Fetch errors fall back to the
    /// cached copy, or the default policy.
    pub async fn get(&self, service_id: &str) -> Arc<MeshPolicy> {
        if let Some(entry) = self.entries.get(service_id) {
            return Arc::clone(&entry.policy);
        }
        if let Err(e) = self.refresh_service(service_id).await {
            warn!(service_id = %service_id, error = %e, "policy fetch failed, using default");
        }
        self.cached(service_id)
    }

    /// Returns the cached policy without contacting the source.
    pub fn cached(&self, service_id: &str) -> Arc<MeshPolicy> {
        self.entries
            .get(service_id)
            .map(|e| Arc::clone(&e.policy))
            .unwrap_or_default()
    }

    /// Version of the cached copy, 0 when only the default is known.
    pub fn cached_version(&self, service_id: &str) -> u64 {
        self.entries.get(service_id).map(|e| e.version).unwrap_or(0)
    }

    /// Fetches a newer policy for one service. Returns true if the cache
    /// changed. On error the stale copy is kept.
    pub async fn refresh_service(&self, service_id: &str) -> Result<bool, PolicyError> {
        let since = self.cached_version(service_id);
        let fetched = self.source.fetch(service_id, since).await;

        let mut entry = self
            .entries
            .entry(service_id.to_string())
            .or_insert_with(|| CachedPolicy {
                version: 0,
                policy: Arc::new(MeshPolicy::default()),
            });

        match fetched? {
            Some(update) if update.version > entry.version => {
                debug!(
                    service_id = %service_id,
                    from = entry.version,
                    to = update.version,
                    "policy cache updated"
                );
                *entry = CachedPolicy {
                    version: update.version,
                    policy: Arc::new(update.policy),
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Services with a cached policy.
    pub fn services(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Refreshes every tracked service.
    pub async fn refresh_all(&self) {
        for service_id in self.services() {
            if let Err(e) = self.refresh_service(&service_id).await {
                warn!(service_id = %service_id, error = %e, "policy refresh failed, keeping cached copy");
            }
        }
    }

    /// Refreshes on every interval tick and on every push notification until
    /// shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut push: Option<watch::Receiver<u64>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        loop {
            let pushed = async {
                match push.as_mut() {
                    Some(rx) => rx.changed().await.is_ok(),
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = ticker.tick() => self.refresh_all().await,
                ok = pushed => {
                    if ok {
                        self.refresh_all().await;
                    } else {
                        debug!("policy push channel closed, polling only");
                        push = None;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping policy refresh");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn policy(timeout_ms: u64) -> MeshPolicy {
        MeshPolicy {
            timeout_ms,
            ..MeshPolicy::default()
        }
    }

    #[test]
    fn test_apply_policy_versions_monotonically() {
        let cp = ControlPlane::new();
        assert_eq!(cp.version(), 0);
        assert_eq!(cp.apply_policy("lake", policy(100)).unwrap(), 1);
        assert_eq!(cp.apply_policy("cortex", policy(200)).unwrap(), 2);
        assert_eq!(cp.apply_policy("lake", policy(300)).unwrap(), 3);

        assert_eq!(cp.get_policy("lake").timeout_ms, 300);
        assert_eq!(cp.get_versioned("cortex").unwrap().version, 2);
    }

    #[test]
    fn test_unknown_service_gets_default() {
        let cp = ControlPlane::new();
        assert_eq!(cp.get_policy("nobody"), MeshPolicy::default());
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let cp = ControlPlane::new();
        assert!(matches!(
            cp.apply_policy("lake", policy(0)),
            Err(PolicyError::Invalid(_))
        ));
        assert_eq!(cp.version(), 0);
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let cp = ControlPlane::new();
        cp.apply_policy("lake", policy(100)).unwrap();
        let before = cp.snapshot();
        cp.apply_policy("lake", policy(200)).unwrap();

        assert_eq!(before.version, 1);
        assert_eq!(before.policies["lake"].policy.timeout_ms, 100);
        assert_eq!(cp.snapshot().policies["lake"].policy.timeout_ms, 200);
    }

    #[test]
    fn test_get_policy_since() {
        let cp = ControlPlane::new();
        cp.apply_policy("lake", policy(100)).unwrap();
        assert!(cp.get_policy_since("lake", 0).is_some());
        assert!(cp.get_policy_since("lake", 1).is_none());
    }

    #[tokio::test]
    async fn test_subscribe_sees_latest_version() {
        let cp = ControlPlane::new();
        let mut rx = cp.subscribe();
        cp.apply_policy("lake", policy(100)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_cache_tolerates_stale_reads() {
        let cp = Arc::new(ControlPlane::new());
        cp.apply_policy("lake", policy(100)).unwrap();
        let cache = PolicyCache::new(cp.clone(), Duration::from_secs(5));

        assert_eq!(cache.get("lake").await.timeout_ms, 100);
        cp.apply_policy("lake", policy(200)).unwrap();
        assert_eq!(cache.get("lake").await.timeout_ms, 100);

        assert!(cache.refresh_service("lake").await.unwrap());
        assert_eq!(cache.get("lake").await.timeout_ms, 200);
        assert_eq!(cache.cached_version("lake"), 2);
        assert!(!cache.refresh_service("lake").await.unwrap());
    }

    struct FlakySource {
        inner: ControlPlane,
        down: AtomicBool,
    }

    #[async_trait]
    impl PolicySource for FlakySource {
        async fn fetch(
            &self,
            service_id: &str,
            since_version: u64,
        ) -> Result<Option<VersionedPolicy>, PolicyError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(PolicyError::Unavailable("connection refused".to_string()));
            }
            self.inner.fetch(service_id, since_version).await
        }
    }

    #[tokio::test]
    async fn test_cache_keeps_stale_copy_on_error() {
        let source = Arc::new(FlakySource {
            inner: ControlPlane::new(),
            down: AtomicBool::new(false),
        });
        source.inner.apply_policy("lake", policy(100)).unwrap();
        let cache = PolicyCache::new(source.clone(), Duration::from_secs(5));
        assert_eq!(cache.get("lake").await.timeout_ms, 100);

        source.down.store(true, Ordering::SeqCst);
        source.inner.apply_policy("lake", policy(200)).unwrap();
        assert!(cache.refresh_service("lake").await.is_err());
        assert_eq!(cache.get("lake").await.timeout_ms, 100);

        assert_eq!(cache.get("unseen").await.timeout_ms, MeshPolicy::default().timeout_ms);
    }

    #[tokio::test]
    async fn test_push_triggers_refresh() {
        let cp = Arc::new(ControlPlane::new());
        let cache = Arc::new(PolicyCache::new(cp.clone(), Duration::from_secs(3600)));
        assert_eq!(cache.get("lake").await.timeout_ms, 5_000);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(Arc::clone(&cache).run(Some(cp.subscribe()), shutdown_rx));

        cp.apply_policy("lake", policy(750)).unwrap();
        for _ in 0..100 {
            if cache.cached_version("lake") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.cached("lake").timeout_ms, 750);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_http_policy_uri() {
        let source =
            HttpPolicySource::new("http://127.0.0.1:15010/", Duration::from_secs(1)).unwrap();
        let uri = source.policy_uri("lake", 4).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:15010/policy/lake?since_version=4");
    }
}
