//! Data-plane HTTP proxy.
//!
//! Inbound requests name a logical service through `x-mesh-service` (or the
//! `Host` header) and are forwarded through the [`MeshClient`], so they get
//! load balancing, circuit breaking, retries and request signing. When the
//! downstream connection goes away the in-flight call is cancelled.

use crate::client::MeshClient;
use crate::error::{CallError, MeshError, SecurityError, TokenError};
use crate::security::{
    RequestScope, SecurityLayer, SignedPayload, HEADER_CALLER, HEADER_KEY_ID, HEADER_SIGNATURE,
    HEADER_TIMESTAMP,
};
use crate::server::{error_response, ResponseBody};
use crate::transport::{MeshRequest, MeshResponse};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, HOST, TRANSFER_ENCODING,
};
use http::request::Parts;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, instrument, warn};

/// Names the target service.
pub const HEADER_SERVICE: &str = "x-mesh-service";
/// Routing key for consistent hashing.
pub const HEADER_ROUTING_KEY: &str = "x-mesh-routing-key";
/// Transport attempts made for the response.
pub const HEADER_ATTEMPTS: &str = "x-mesh-attempts";

/// Largest request body the proxy buffers.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

const HOP_BY_HOP: [&str; 6] = [
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

fn strip_headers(headers: &mut HeaderMap, extra: &[&str]) {
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    for name in HOP_BY_HOP.iter().chain(extra) {
        headers.remove(*name);
    }
}

fn path_and_query(parts: &Parts) -> String {
    parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Status returned to the downstream client for a failed call.
pub fn status_for(error: &MeshError) -> StatusCode {
    match error {
        MeshError::ServiceUnavailable { .. }
        | MeshError::NoHealthyEndpoint(_)
        | MeshError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        MeshError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        MeshError::Security(SecurityError::Token(_)) => StatusCode::UNAUTHORIZED,
        MeshError::Security(_) => StatusCode::FORBIDDEN,
        MeshError::ServerError { .. } | MeshError::Transport(_) | MeshError::Cancelled => {
            StatusCode::BAD_GATEWAY
        }
    }
}

/// Proxy forwarding inbound requests through the mesh.
#[derive(Clone)]
pub struct ProxyService {
    client: Arc<MeshClient>,
    security: Option<Arc<SecurityLayer>>,
    verify_inbound: bool,
}

impl ProxyService {
    pub fn new(client: Arc<MeshClient>) -> Self {
        Self {
            client,
            security: None,
            verify_inbound: false,
        }
    }

    /// Rejects inbound requests without a valid signature with 401. Bearer
    /// tokens are validated as well when the layer has a token validator.
    pub fn with_inbound_verification(mut self, security: Arc<SecurityLayer>) -> Self {
        self.security = Some(security);
        self.verify_inbound = true;
        self
    }

    /// Logical service named by the request.
    fn target(headers: &HeaderMap) -> Option<String> {
        let from_header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        if let Some(service) = from_header(HeaderName::from_static(HEADER_SERVICE)) {
            return Some(service.to_string());
        }
        from_header(HOST).map(|host| match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
            _ => host.to_string(),
        })
    }

    /// Checks the caller's signature against the request as received and
    /// the service it is about to be forwarded to.
    async fn verify(
        &self,
        parts: &Parts,
        service_id: &str,
        body: &Bytes,
    ) -> Result<(), SecurityError> {
        let Some(security) = &self.security else {
            return Ok(());
        };
        let headers = &parts.headers;
        let scope = RequestScope::new(&parts.method, &path_and_query(parts), service_id);
        let signed = SignedPayload::from_headers(headers, scope, body.clone())?;
        security.verify_request(&signed)?;

        if security.has_token_validator() {
            let token = headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or_else(|| {
                    SecurityError::Token(TokenError::Invalid("missing bearer token".to_string()))
                })?;
            security.validate_token(token).await?;
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    async fn forward<B>(self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let Some(service_id) = Self::target(&parts.headers) else {
            return error_response(StatusCode::BAD_REQUEST, "missing x-mesh-service or Host header");
        };

        let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                warn!(service_id = %service_id, limit = MAX_BODY_BYTES, "request body too large");
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
            }
            Err(e) => {
                warn!("failed to read request body: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "Unreadable request body");
            }
        };

        if self.verify_inbound {
            if let Err(e) = self.verify(&parts, &service_id, &body).await {
                warn!(service_id = %service_id, error = %e, "rejected unauthenticated request");
                return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
            }
        }

        let routing_key = parts
            .headers
            .get(HEADER_ROUTING_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let path = path_and_query(&parts);
        let mut headers = parts.headers;
        strip_headers(
            &mut headers,
            &[
                HOST.as_str(),
                HEADER_SERVICE,
                HEADER_ROUTING_KEY,
                HEADER_CALLER,
                HEADER_KEY_ID,
                HEADER_TIMESTAMP,
                HEADER_SIGNATURE,
            ],
        );
        let request = MeshRequest {
            method: parts.method,
            path,
            headers,
            body,
        };

        // Cancelled if this future is dropped when the downstream connection closes.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let client = Arc::clone(&self.client);
        let target = service_id.clone();
        let call = tokio::spawn(async move {
            client
                .call_with_cancel(&target, request, routing_key.as_deref(), &cancel)
                .await
        });
        match call.await {
            Ok(Ok(response)) => Self::response_from(response),
            Ok(Err(e)) => Self::failure_response(&service_id, e),
            Err(e) => {
                warn!("proxy call task failed: {}", e);
                error_response(StatusCode::BAD_GATEWAY, "Proxy error")
            }
        }
    }

    fn response_from(response: MeshResponse) -> Response<ResponseBody> {
        let mut headers = response.headers;
        strip_headers(&mut headers, &[]);
        headers.insert(HEADER_ATTEMPTS, HeaderValue::from(response.attempts));

        let mut out = Response::new(
            Full::new(response.body)
                .map_err(|never| match never {})
                .boxed(),
        );
        *out.status_mut() = response.status;
        *out.headers_mut() = headers;
        out
    }

    fn failure_response(service_id: &str, error: CallError) -> Response<ResponseBody> {
        let status = status_for(&error.cause);
        debug!(service_id = %service_id, attempts = error.attempts, error = %error, "call failed");
        let mut response = error_response(status, &error.to_string());
        response
            .headers_mut()
            .insert(HEADER_ATTEMPTS, HeaderValue::from(error.attempts));
        response
    }
}

impl<B> Service<Request<B>> for ProxyService
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
        Box::pin(async move { Ok(this.forward(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{LoadBalancer, ServiceEndpoint};
    use crate::config::{RegistryConfig, SecurityConfig};
    use crate::control_plane::{ControlPlane, PolicyCache};
    use crate::error::TransportError;
    use crate::health::HealthTracker;
    use crate::registry::{ServiceInstance, ServiceRegistry};
    use crate::security::LocalCertificateAuthority;
    use crate::transport::{SecurityContext, Transport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Echoes the request path and records forwarded headers.
    #[derive(Default)]
    struct EchoTransport {
        seen: Mutex<Vec<HeaderMap>>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(
            &self,
            endpoint: &ServiceEndpoint,
            request: MeshRequest,
            _security: &SecurityContext,
        ) -> Result<MeshResponse, TransportError> {
            self.seen.lock().push(request.headers.clone());
            if request.path == "/fail" {
                return Ok(MeshResponse::new(StatusCode::BAD_GATEWAY, "down"));
            }
            Ok(MeshResponse::new(
                StatusCode::OK,
                format!("{} {}", endpoint.instance_id, request.path),
            ))
        }
    }

    fn proxy() -> (ProxyService, Arc<EchoTransport>, Arc<ServiceRegistry>) {
        let health = Arc::new(HealthTracker::new(1, 1));
        let registry = Arc::new(ServiceRegistry::new(
            RegistryConfig::default(),
            Arc::clone(&health),
        ));
        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&registry), health));
        let plane = Arc::new(ControlPlane::new());
        let mut policy = crate::policy::MeshPolicy::default();
        policy.retry_policy = crate::retry::RetryPolicy::no_retries();
        plane.apply_policy("lake", policy).unwrap();
        let policies = Arc::new(PolicyCache::new(plane, Duration::from_secs(60)));
        let transport = Arc::new(EchoTransport::default());
        let client = Arc::new(MeshClient::new(
            "proxy-test",
            Arc::clone(&registry),
            balancer,
            policies,
            transport.clone(),
        ));
        (ProxyService::new(client), transport, registry)
    }

    fn add_instance(registry: &ServiceRegistry, id: &str) {
        let instance = ServiceInstance::new("lake", id, "10.0.0.1", 8001);
        let key = instance.key();
        registry.register(instance).unwrap();
        registry.health().record_success(&key);
    }

    fn request(uri: &str, service: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().uri(uri).header(HOST, "lake:8080");
        if let Some(service) = service {
            builder = builder.header(HEADER_SERVICE, service);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    async fn body_text(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_target_resolution() {
        let mut headers = HeaderMap::new();
        assert_eq!(ProxyService::target(&headers), None);
        headers.insert(HOST, HeaderValue::from_static("lake:8080"));
        assert_eq!(ProxyService::target(&headers).as_deref(), Some("lake"));
        headers.insert(HEADER_SERVICE, HeaderValue::from_static("cortex"));
        assert_eq!(ProxyService::target(&headers).as_deref(), Some("cortex"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&MeshError::CircuitOpen { target: "x".into() }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&MeshError::timeout(Duration::from_millis(10))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&MeshError::Security(SecurityError::Token(TokenError::Expired))),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&MeshError::Security(SecurityError::InvalidSignature("x".into()))),
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn test_forwards_to_service() {
        let (mut proxy, transport, registry) = proxy();
        add_instance(&registry, "i1");

        let response = proxy
            .call(request("/orders?id=7", Some("lake")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[HEADER_ATTEMPTS], "1");
        assert_eq!(body_text(response).await, "i1 /orders?id=7");

        let forwarded = transport.seen.lock()[0].clone();
        assert!(forwarded.get(HEADER_SERVICE).is_none());
        assert!(forwarded.get(HOST).is_none());
    }

    #[tokio::test]
    async fn test_failures_are_mapped() {
        let (mut proxy, _, registry) = proxy();

        let response = proxy.call(request("/", Some("lake"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[HEADER_ATTEMPTS], "0");

        add_instance(&registry, "i1");
        let response = proxy.call(request("/fail", Some("lake"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[HEADER_ATTEMPTS], "1");
    }

    #[tokio::test]
    async fn test_inbound_verification() {
        let (proxy, _, registry) = proxy();
        add_instance(&registry, "i1");
        let security = Arc::new(SecurityLayer::new(
            SecurityConfig::default(),
            Arc::new(LocalCertificateAuthority::generate("proxy-test-root").unwrap()),
            None,
        ));
        let mut proxy = proxy.with_inbound_verification(Arc::clone(&security));

        let response = proxy.call(request("/", Some("lake"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let credentials = security.establish_mtls("gateway").await.unwrap();
        let signed = security
            .sign_request(
                RequestScope::new(&http::Method::GET, "/orders", "lake"),
                Bytes::new(),
                &credentials,
            )
            .unwrap();
        let mut req = request("/orders", Some("lake"));
        signed.write_headers(req.headers_mut()).unwrap();
        let response = proxy.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The same signature does not carry over to another path or target.
        let mut req = request("/admin", Some("lake"));
        signed.write_headers(req.headers_mut()).unwrap();
        let response = proxy.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut req = request("/orders", Some("vault"));
        signed.write_headers(req.headers_mut()).unwrap();
        let response = proxy.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (mut proxy, transport, registry) = proxy();
        add_instance(&registry, "i1");

        let req = Request::builder()
            .method(http::Method::POST)
            .uri("/upload")
            .header(HEADER_SERVICE, "lake")
            .body(Full::new(Bytes::from(vec![0u8; MAX_BODY_BYTES + 1])))
            .unwrap();
        let response = proxy.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(transport.seen.lock().is_empty());

        let req = Request::builder()
            .method(http::Method::POST)
            .uri("/upload")
            .header(HEADER_SERVICE, "lake")
            .body(Full::new(Bytes::from(vec![0u8; 1024])))
            .unwrap();
        let response = proxy.call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
