//! Registration, policy and admin HTTP endpoints.
//!
//! Serves:
//! - `POST /register`, `DELETE /register/{service}/{instance}`
//! - `PUT /heartbeat/{service}/{instance}`
//! - `GET /services`, `GET /services/{service}`
//! - `PUT /policy/{service}`, `GET /policy/{service}?since_version=N`
//! - `GET /health`, `GET /metrics`
//!
//! [`ControlApi::admin_only`] serves just the last two.

use crate::control_plane::ControlPlane;
use crate::error::RegistryError;
use crate::health::HealthStatus;
use crate::metrics::Metrics;
use crate::policy::MeshPolicy;
use crate::registry::{ServiceInstance, ServiceRegistry};
use crate::server::{empty_response, error_response, full_response, ResponseBody};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, info, warn};

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Serialize)]
struct InstanceView<'a> {
    #[serde(flatten)]
    instance: &'a ServiceInstance,
    health: HealthStatus,
    heartbeat_age_ms: u64,
}

#[derive(Serialize)]
struct VersionView {
    version: u64,
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => full_response(status, "application/json", body),
        Err(e) => {
            warn!("failed to encode response: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response")
        }
    }
}

/// Control plane and admin service.
#[derive(Clone, Default)]
pub struct ControlApi {
    registry: Option<Arc<ServiceRegistry>>,
    plane: Option<Arc<ControlPlane>>,
}

impl ControlApi {
    pub fn new(registry: Arc<ServiceRegistry>, plane: Arc<ControlPlane>) -> Self {
        Self {
            registry: Some(registry),
            plane: Some(plane),
        }
    }

    /// Serves only `/health` and `/metrics`.
    pub fn admin_only() -> Self {
        Self::default()
    }

    async fn handle<B>(self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => {
                debug!("health check requested");
                full_response(StatusCode::OK, "text/plain", "healthy")
            }
            (&Method::GET, ["metrics"]) => match Metrics::encode() {
                Ok(metrics) => full_response(StatusCode::OK, "text/plain; version=0.0.4", metrics),
                Err(e) => {
                    warn!("failed to encode metrics: {}", e);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
                }
            },
            _ => match (&self.registry, &self.plane) {
                (Some(registry), Some(plane)) => {
                    Self::route(registry, plane, &method, &segments, &query, req).await
                }
                _ => error_response(StatusCode::NOT_FOUND, "Not Found"),
            },
        }
    }

    async fn route<B>(
        registry: &ServiceRegistry,
        plane: &ControlPlane,
        method: &Method,
        segments: &[&str],
        query: &str,
        req: Request<B>,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match (method, segments) {
            (&Method::POST, ["register"]) => {
                let body = match read_body(req).await {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                Self::register(registry, &body)
            }
            (&Method::DELETE, ["register", service_id, instance_id]) => {
                match registry.deregister(service_id, instance_id) {
                    Ok(()) => empty_response(StatusCode::NO_CONTENT),
                    Err(e) => error_response(StatusCode::NOT_FOUND, &e.to_string()),
                }
            }
            (&Method::PUT, ["heartbeat", service_id, instance_id]) => {
                match registry.heartbeat(service_id, instance_id) {
                    Ok(()) => empty_response(StatusCode::OK),
                    Err(e) => error_response(StatusCode::NOT_FOUND, &e.to_string()),
                }
            }
            (&Method::GET, ["services"]) => json_response(StatusCode::OK, &registry.services()),
            (&Method::GET, ["services", service_id]) => {
                let instances = registry.list_instances(service_id);
                let health = registry.health();
                let view: Vec<InstanceView<'_>> = instances
                    .iter()
                    .map(|instance| InstanceView {
                        instance,
                        health: health.status(&instance.key()),
                        heartbeat_age_ms: instance.heartbeat_age().as_millis() as u64,
                    })
                    .collect();
                json_response(StatusCode::OK, &view)
            }
            (&Method::PUT, ["policy", service_id]) => {
                let body = match read_body(req).await {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                let policy: MeshPolicy = match serde_json::from_slice(&body) {
                    Ok(policy) => policy,
                    Err(e) => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            &format!("invalid policy: {}", e),
                        )
                    }
                };
                match plane.apply_policy(service_id, policy) {
                    Ok(version) => json_response(StatusCode::OK, &VersionView { version }),
                    Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
                }
            }
            (&Method::GET, ["policy", service_id]) => {
                let Some(current) = plane.get_versioned(service_id) else {
                    return error_response(StatusCode::NOT_FOUND, "no policy for service");
                };
                match since_version(query) {
                    Some(since) if current.version <= since => {
                        empty_response(StatusCode::NOT_MODIFIED)
                    }
                    _ => json_response(StatusCode::OK, current.as_ref()),
                }
            }
            (_, ["register", ..] | ["heartbeat", ..] | ["services", ..] | ["policy", ..]) => {
                error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
            }
            _ => error_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    fn register(registry: &ServiceRegistry, body: &[u8]) -> Response<ResponseBody> {
        let instance: ServiceInstance = match serde_json::from_slice(body) {
            Ok(instance) => instance,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, &format!("invalid instance: {}", e))
            }
        };
        if instance.service_id.is_empty() || instance.instance_id.is_empty() {
            return error_response(
                StatusCode::BAD_REQUEST,
                "service_id and instance_id are required",
            );
        }
        if instance.host.is_empty() || instance.port == 0 {
            return error_response(StatusCode::BAD_REQUEST, "host and port are required");
        }

        match registry.register(instance.clone()) {
            Ok(()) => {
                info!(key = %instance.key(), "instance registered through API");
                json_response(StatusCode::OK, &instance)
            }
            Err(e @ RegistryError::DuplicateInstance { .. }) => {
                error_response(StatusCode::CONFLICT, &e.to_string())
            }
            Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        }
    }
}

fn since_version(query: &str) -> Option<u64> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "since_version")
        .and_then(|(_, v)| v.parse().ok())
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes, Response<ResponseBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("unreadable body: {}", e)))
}

impl<B> Service<Request<B>> for ControlApi
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::health::HealthTracker;
    use http_body_util::Full;

    fn api() -> (ControlApi, Arc<ServiceRegistry>, Arc<ControlPlane>) {
        let registry = Arc::new(ServiceRegistry::new(
            RegistryConfig::default(),
            Arc::new(HealthTracker::new(2, 3)),
        ));
        let plane = Arc::new(ControlPlane::new());
        (
            ControlApi::new(Arc::clone(&registry), Arc::clone(&plane)),
            registry,
            plane,
        )
    }

    async fn send(
        api: &ControlApi,
        method: Method,
        uri: &str,
        body: &str,
    ) -> (StatusCode, String) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let response = api.clone().call(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    const LAKE_I1: &str =
        r#"{"service_id":"lake","instance_id":"i1","host":"10.0.0.1","port":8001,"metadata":{"version":"v1"}}"#;

    #[tokio::test]
    async fn test_register_list_deregister() {
        let (api, registry, _) = api();

        let (status, body) = send(&api, Method::POST, "/register", LAKE_I1).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"instance_id\":\"i1\""));
        assert_eq!(registry.list_instances("lake").len(), 1);

        let (status, _) = send(&api, Method::POST, "/register", LAKE_I1).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&api, Method::GET, "/services/lake", "").await;
        assert_eq!(status, StatusCode::OK);
        let listed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listed[0]["instance_id"], "i1");
        assert_eq!(listed[0]["health"], "UNKNOWN");
        assert_eq!(listed[0]["health_check_endpoint"], "/health");

        let (status, _) = send(&api, Method::PUT, "/heartbeat/lake/i1", "").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&api, Method::DELETE, "/register/lake/i1", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&api, Method::DELETE, "/register/lake/i1", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&api, Method::PUT, "/heartbeat/lake/i1", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_payloads() {
        let (api, _, _) = api();
        let (status, _) = send(&api, Method::POST, "/register", "{").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &api,
            Method::POST,
            "/register",
            r#"{"service_id":"lake","instance_id":"","host":"h","port":1}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_policy_versioning() {
        let (api, _, plane) = api();

        let (status, _) = send(&api, Method::GET, "/policy/lake?since_version=0", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) =
            send(&api, Method::PUT, "/policy/lake", r#"{"timeout_ms": 250}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"version":1}"#);
        assert_eq!(plane.get_policy("lake").timeout_ms, 250);

        let (status, body) = send(&api, Method::GET, "/policy/lake?since_version=0", "").await;
        assert_eq!(status, StatusCode::OK);
        let fetched: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(fetched["version"], 1);
        assert_eq!(fetched["policy"]["timeout_ms"], 250);

        let (status, _) = send(&api, Method::GET, "/policy/lake?since_version=1", "").await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);

        let (status, _) = send(&api, Method::PUT, "/policy/lake", r#"{"timeout_ms": 0}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(plane.version(), 1);
    }

    #[tokio::test]
    async fn test_admin_only() {
        let api = ControlApi::admin_only();
        let (status, body) = send(&api, Method::GET, "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "healthy");

        let (status, _) = send(&api, Method::GET, "/metrics", "").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&api, Method::POST, "/register", LAKE_I1).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (api, _, _) = api();
        let (status, _) = send(&api, Method::GET, "/register", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let (status, _) = send(&api, Method::GET, "/nowhere", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
