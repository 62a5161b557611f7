//! External service discovery backend.
//!
//! The registry stays authoritative for selection; the discovery backend is
//! where instances are published for other nodes and where remote instances
//! are pulled from. Pulled catalog entries are relabeled into
//! [`ServiceInstance`]s and ingested on a fixed interval by
//! [`DiscoverySync`].

use crate::error::DiscoveryError;
use crate::registry::{InstanceKey, RegistryEvent, ServiceInstance, ServiceRegistry};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

/// Backend holding the mesh-wide service catalog.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Healthy instances of `service` known to the backend.
    async fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>, DiscoveryError>;

    /// Announces a local instance.
    async fn publish(&self, instance: &ServiceInstance) -> Result<(), DiscoveryError>;

    /// Removes a previously published instance.
    async fn withdraw(&self, key: &InstanceKey) -> Result<(), DiscoveryError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CatalogNode {
    pub node: String,
    pub address: String,
    pub datacenter: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CatalogService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    pub tags: Option<Vec<String>>,
    pub address: String,
    pub port: u16,
    pub meta: Option<BTreeMap<String, String>>,
}

/// One entry of `GET /v1/health/service/{name}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CatalogEntry {
    pub node: CatalogNode,
    pub service: CatalogService,
}

impl CatalogEntry {
    /// Converts the entry into a registry instance.
    ///
    /// The service address wins over the node address. Metadata keeps the
    /// entry's `Meta` and gains `service`, `service_id`, `dc` and `tags`
    /// (comma-joined).
    pub fn relabel(self) -> ServiceInstance {
        let CatalogEntry { node, service } = self;
        let host = if service.address.is_empty() {
            node.address
        } else {
            service.address
        };

        let mut metadata = service.meta.unwrap_or_default();
        let health_check_endpoint = metadata
            .remove("health_check_endpoint")
            .unwrap_or_else(|| "/health".to_string());
        metadata.insert("service".to_string(), service.service.clone());
        metadata.insert("service_id".to_string(), service.id.clone());
        if !node.datacenter.is_empty() {
            metadata.insert("dc".to_string(), node.datacenter);
        }
        let tags = service.tags.unwrap_or_default();
        if !tags.is_empty() {
            metadata.insert("tags".to_string(), tags.join(","));
        }

        let mut instance = ServiceInstance::new(service.service, service.id, host, service.port)
            .with_health_check_endpoint(health_check_endpoint);
        instance.metadata = metadata;
        instance
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck {
    #[serde(rename = "HTTP")]
    http: String,
    interval: String,
    timeout: String,
    deregister_critical_service_after: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    meta: &'a BTreeMap<String, String>,
    check: AgentCheck,
}

/// Consul HTTP API client.
pub struct ConsulCatalog {
    base: Url,
    client: Client<HttpConnector, Full<Bytes>>,
    token: Option<String>,
    datacenter: Option<String>,
    timeout: Duration,
}

impl ConsulCatalog {
    /// Creates a client for the agent at `base`, e.g. `http://127.0.0.1:8500`.
    pub fn new(base: &str) -> Result<Self, DiscoveryError> {
        Ok(Self {
            base: Url::parse(base)?,
            client: Client::builder(TokioExecutor::new()).build_http(),
            token: None,
            datacenter: None,
            timeout: Duration::from_secs(5),
        })
    }

    /// Sends `X-Consul-Token` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Restricts catalog queries to one datacenter.
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, DiscoveryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| DiscoveryError::Request {
                url: self.base.to_string(),
                reason: "base url cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, body: Bytes) -> Result<Bytes, DiscoveryError> {
        let request_error = |reason: String| DiscoveryError::Request {
            url: url.to_string(),
            reason,
        };

        let mut builder = Request::builder().method(method).uri(url.as_str());
        if let Some(token) = &self.token {
            builder = builder.header("X-Consul-Token", token.as_str());
        }
        if !body.is_empty() {
            builder = builder.header(http::header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| request_error(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| request_error("timed out".to_string()))?
            .map_err(|e| request_error(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| request_error(e.to_string()))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(DiscoveryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulCatalog {
    async fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let mut query = vec![("passing", "true")];
        if let Some(dc) = &self.datacenter {
            query.push(("dc", dc.as_str()));
        }
        let url = self.url(&["v1", "health", "service", service], &query)?;
        let body = self.send(Method::GET, url, Bytes::new()).await?;
        let entries: Vec<CatalogEntry> = serde_json::from_slice(&body)?;
        debug!(service = %service, count = entries.len(), "fetched catalog entries");
        Ok(entries.into_iter().map(CatalogEntry::relabel).collect())
    }

    async fn publish(&self, instance: &ServiceInstance) -> Result<(), DiscoveryError> {
        let registration = AgentRegistration {
            id: &instance.instance_id,
            name: &instance.service_id,
            address: &instance.host,
            port: instance.port,
            meta: &instance.metadata,
            check: AgentCheck {
                http: instance.health_check_uri(),
                interval: "10s".to_string(),
                timeout: "5s".to_string(),
                deregister_critical_service_after: "30s".to_string(),
            },
        };
        let url = self.url(&["v1", "agent", "service", "register"], &[])?;
        let body = serde_json::to_vec(&registration)?;
        self.send(Method::PUT, url, Bytes::from(body)).await?;
        info!(key = %instance.key(), "instance published to discovery backend");
        Ok(())
    }

    async fn withdraw(&self, key: &InstanceKey) -> Result<(), DiscoveryError> {
        let url = self.url(
            &["v1", "agent", "service", "deregister", &key.instance_id],
            &[],
        )?;
        self.send(Method::PUT, url, Bytes::new()).await?;
        info!(key = %key, "instance withdrawn from discovery backend");
        Ok(())
    }
}

/// Periodically pulls services from a backend into the registry, and
/// mirrors local registrations of other services back to it.
pub struct DiscoverySync {
    backend: Arc<dyn DiscoveryBackend>,
    registry: Arc<ServiceRegistry>,
    services: Vec<String>,
    interval: Duration,
}

impl DiscoverySync {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        registry: Arc<ServiceRegistry>,
        services: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            services,
            interval,
        }
    }

    /// Pulls every configured service once. Returns the number of instances
    /// ingested; failing services are skipped.
    pub async fn sync_once(&self) -> usize {
        let mut ingested = 0;
        for service in &self.services {
            match self.backend.instances(service).await {
                Ok(instances) => ingested += self.registry.ingest(service, instances),
                Err(e) => warn!(service = %service, error = %e, "discovery sync failed"),
            }
        }
        ingested
    }

    fn is_pulled(&self, key: &InstanceKey) -> bool {
        self.services.iter().any(|s| *s == key.service_id)
    }

    /// Publishes or withdraws the instance behind a registry event. Events
    /// for pulled services are ignored.
    pub async fn mirror(&self, event: RegistryEvent) -> Result<(), DiscoveryError> {
        match event {
            RegistryEvent::Registered(key) if !self.is_pulled(&key) => {
                match self.registry.get(&key.service_id, &key.instance_id) {
                    Some(instance) => self.backend.publish(&instance).await,
                    None => Ok(()),
                }
            }
            RegistryEvent::Deregistered { key, .. } if !self.is_pulled(&key) => {
                self.backend.withdraw(&key).await
            }
            _ => Ok(()),
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(services = ?self.services, "discovery sync started");
        let mut events = self.registry.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ingested = self.sync_once().await;
                    debug!(ingested, "discovery sync completed");
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.mirror(event).await {
                            warn!(error = %e, "failed to mirror registration");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "discovery mirror lagged behind registry events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping discovery sync");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::health::HealthTracker;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    const CATALOG: &str = r#"[
        {
            "Node": {"Node": "n1", "Address": "10.1.0.1", "Datacenter": "dc1"},
            "Service": {
                "ID": "lake-1", "Service": "lake", "Tags": ["primary", "v1"],
                "Address": "10.0.0.1", "Port": 8001,
                "Meta": {"version": "v1", "health_check_endpoint": "/ready"}
            },
            "Checks": []
        },
        {
            "Node": {"Node": "n2", "Address": "10.1.0.2", "Datacenter": "dc1"},
            "Service": {"ID": "lake-2", "Service": "lake", "Tags": null, "Address": "", "Port": 8002, "Meta": null}
        }
    ]"#;

    #[test]
    fn test_relabel() {
        let entries: Vec<CatalogEntry> = serde_json::from_str(CATALOG).unwrap();
        let instances: Vec<ServiceInstance> =
            entries.into_iter().map(CatalogEntry::relabel).collect();

        let first = &instances[0];
        assert_eq!(first.service_id, "lake");
        assert_eq!(first.instance_id, "lake-1");
        assert_eq!(first.host, "10.0.0.1");
        assert_eq!(first.health_check_endpoint, "/ready");
        assert_eq!(first.metadata["dc"], "dc1");
        assert_eq!(first.metadata["tags"], "primary,v1");
        assert_eq!(first.metadata["service_id"], "lake-1");
        assert_eq!(first.metadata["version"], "v1");
        assert!(!first.metadata.contains_key("health_check_endpoint"));

        let second = &instances[1];
        assert_eq!(second.host, "10.1.0.2");
        assert_eq!(second.health_check_endpoint, "/health");
        assert!(!second.metadata.contains_key("tags"));
    }

    async fn mock_consul(seen: Arc<Mutex<Vec<String>>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let seen = Arc::clone(&seen);
                        async move {
                            let line = format!("{} {}", req.method(), req.uri());
                            seen.lock().push(line);
                            let body = if req.uri().path().starts_with("/v1/health/service/lake") {
                                CATALOG
                            } else {
                                ""
                            };
                            Ok::<_, Infallible>(hyper::Response::new(Full::new(Bytes::from(body))))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_consul_catalog_requests() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = mock_consul(Arc::clone(&seen)).await;
        let catalog = ConsulCatalog::new(&base).unwrap().with_datacenter("dc1");

        let instances = catalog.instances("lake").await.unwrap();
        assert_eq!(instances.len(), 2);

        let local = ServiceInstance::new("cortex", "c1", "10.0.0.9", 9000);
        catalog.publish(&local).await.unwrap();
        catalog.withdraw(&local.key()).await.unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen[0], "GET /v1/health/service/lake?passing=true&dc=dc1");
        assert_eq!(seen[1], "PUT /v1/agent/service/register");
        assert_eq!(seen[2], "PUT /v1/agent/service/deregister/c1");
    }

    #[derive(Default)]
    struct StaticBackend {
        published: Mutex<Vec<String>>,
        withdrawn: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DiscoveryBackend for StaticBackend {
        async fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
            if service == "broken" {
                return Err(DiscoveryError::Status {
                    url: "static".to_string(),
                    status: 500,
                });
            }
            Ok(vec![
                ServiceInstance::new(service, "r1", "10.2.0.1", 7000),
                ServiceInstance::new(service, "r2", "10.2.0.2", 7000),
            ])
        }

        async fn publish(&self, instance: &ServiceInstance) -> Result<(), DiscoveryError> {
            self.published.lock().push(instance.key().to_string());
            Ok(())
        }

        async fn withdraw(&self, key: &InstanceKey) -> Result<(), DiscoveryError> {
            self.withdrawn.lock().push(key.to_string());
            Ok(())
        }
    }

    fn registry() -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry::new(
            RegistryConfig::default(),
            Arc::new(HealthTracker::new(2, 3)),
        ))
    }

    #[tokio::test]
    async fn test_sync_ingests_into_registry() {
        let registry = registry();
        let sync = DiscoverySync::new(
            Arc::new(StaticBackend::default()),
            Arc::clone(&registry),
            vec!["remote".to_string(), "broken".to_string()],
            Duration::from_secs(30),
        );

        assert_eq!(sync.sync_once().await, 2);
        assert_eq!(registry.list_instances("remote").len(), 2);
        // A second pull refreshes rather than duplicating.
        sync.sync_once().await;
        assert_eq!(registry.list_instances("remote").len(), 2);
        assert!(registry.list_instances("broken").is_empty());
    }

    #[tokio::test]
    async fn test_mirror_publishes_local_registrations_only() {
        let registry = registry();
        let backend = Arc::new(StaticBackend::default());
        let sync = DiscoverySync::new(
            Arc::clone(&backend) as Arc<dyn DiscoveryBackend>,
            Arc::clone(&registry),
            vec!["remote".to_string()],
            Duration::from_secs(30),
        );
        let mut events = registry.subscribe();

        registry
            .register(ServiceInstance::new("local", "l1", "127.0.0.1", 8080))
            .unwrap();
        sync.mirror(events.recv().await.unwrap()).await.unwrap();

        registry.ingest("remote", vec![ServiceInstance::new("remote", "r1", "10.2.0.1", 7000)]);
        sync.mirror(events.recv().await.unwrap()).await.unwrap();

        registry.deregister("local", "l1").unwrap();
        sync.mirror(events.recv().await.unwrap()).await.unwrap();

        assert_eq!(*backend.published.lock(), vec!["local/l1".to_string()]);
        assert_eq!(*backend.withdrawn.lock(), vec!["local/l1".to_string()]);
    }
}
