//! Transport for a single mesh call attempt.
//!
//! The mesh client hands a [`MeshRequest`] and the selected endpoint to a
//! [`Transport`]. [`HttpTransport`] speaks HTTP/1.1 through hyper, either in
//! plaintext over a pooled client or over mutual TLS with the caller's
//! credentials.

use crate::balancer::ServiceEndpoint;
use crate::error::TransportError;
use crate::security::Credentials;
use crate::tls;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::header::{HeaderValue, HOST};
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Outbound request of a mesh call. Cloned for every attempt.
#[derive(Debug, Clone)]
pub struct MeshRequest {
    pub method: Method,
    /// Path and query sent to the upstream, e.g. `/orders?id=7`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl MeshRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Upstream response, fully buffered.
#[derive(Debug, Clone)]
pub struct MeshResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Transport attempts of the call that produced this response.
    pub attempts: u32,
}

impl MeshResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            attempts: 1,
        }
    }
}

/// TLS identity used for one attempt.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    /// Service whose certificate the upstream must present.
    pub target: String,
    /// Caller credentials; plaintext when `None`.
    pub credentials: Option<Arc<Credentials>>,
}

impl SecurityContext {
    pub fn plaintext(target: &str) -> Self {
        Self {
            target: target.to_string(),
            credentials: None,
        }
    }

    pub fn mutual_tls(target: &str, credentials: Arc<Credentials>) -> Self {
        Self {
            target: target.to_string(),
            credentials: Some(credentials),
        }
    }
}

/// Executes one attempt against a selected endpoint.
///
/// Any HTTP status is a successful transport outcome; the caller decides
/// which statuses count as failures.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &ServiceEndpoint,
        request: MeshRequest,
        security: &SecurityContext,
    ) -> Result<MeshResponse, TransportError>;
}

/// HTTP/1.1 transport over hyper.
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    connect_timeout: Duration,
    /// Connector of the latest credentials, per caller identity.
    connectors: DashMap<String, (String, TlsConnector)>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            connect_timeout,
            connectors: DashMap::new(),
        }
    }

    fn build_request(
        endpoint: &ServiceEndpoint,
        uri: Uri,
        request: MeshRequest,
    ) -> Result<Request<Full<Bytes>>, TransportError> {
        let mut builder = Request::builder().method(request.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers;
            let host = HeaderValue::from_str(&endpoint.address())
                .map_err(|e| TransportError::Other(format!("invalid host header: {}", e)))?;
            headers.insert(HOST, host);
        }
        builder
            .body(Full::new(request.body))
            .map_err(|e| TransportError::Other(format!("failed to build request: {}", e)))
    }

    fn connector(&self, credentials: &Credentials) -> Result<TlsConnector, TransportError> {
        if let Some(entry) = self.connectors.get(&credentials.service_id) {
            if entry.0 == credentials.key_id {
                return Ok(entry.1.clone());
            }
        }
        let connector = tls::connector(credentials)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        self.connectors.insert(
            credentials.service_id.clone(),
            (credentials.key_id.clone(), connector.clone()),
        );
        Ok(connector)
    }

    async fn send_plain(
        &self,
        endpoint: &ServiceEndpoint,
        request: MeshRequest,
    ) -> Result<hyper::Response<Incoming>, TransportError> {
        let addr = endpoint.address();
        let uri: Uri = format!("http://{}{}", addr, request.path)
            .parse()
            .map_err(|e| TransportError::Other(format!("invalid upstream uri: {}", e)))?;
        let req = Self::build_request(endpoint, uri, request)?;

        self.client.request(req).await.map_err(|e| {
            if e.is_connect() {
                return TransportError::Connect {
                    addr: addr.clone(),
                    reason: source_message(&e),
                };
            }
            classify_hyper(&addr, e.source().and_then(|s| s.downcast_ref::<hyper::Error>()))
                .unwrap_or_else(|| TransportError::Other(e.to_string()))
        })
    }

    async fn send_tls(
        &self,
        endpoint: &ServiceEndpoint,
        request: MeshRequest,
        target: &str,
        credentials: &Credentials,
    ) -> Result<hyper::Response<Incoming>, TransportError> {
        let addr = endpoint.address();
        let connect_failure = |reason: String| TransportError::Connect {
            addr: addr.clone(),
            reason,
        };

        let connector = self.connector(credentials)?;
        let server_name =
            tls::server_name(target).map_err(|e| TransportError::Other(e.to_string()))?;

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| connect_failure("connect timed out".to_string()))?
            .map_err(|e| connect_failure(e.to_string()))?;
        let _ = tcp.set_nodelay(true);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| connect_failure(format!("TLS handshake failed: {}", e)))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| connect_failure(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("upstream TLS connection closed: {}", e);
            }
        });

        let uri: Uri = request
            .path
            .parse()
            .map_err(|e| TransportError::Other(format!("invalid upstream path: {}", e)))?;
        let req = Self::build_request(endpoint, uri, request)?;
        sender.send_request(req).await.map_err(|e| {
            classify_hyper(&addr, Some(&e)).unwrap_or_else(|| TransportError::Other(e.to_string()))
        })
    }
}

/// Requests the peer dropped before processing count as refused.
fn classify_hyper(addr: &str, error: Option<&hyper::Error>) -> Option<TransportError> {
    let error = error?;
    if error.is_canceled() {
        return Some(TransportError::RefusedStream {
            addr: addr.to_string(),
        });
    }
    None
}

fn source_message(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message = format!("{}: {}", message, inner);
        source = inner.source();
    }
    message
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &ServiceEndpoint,
        request: MeshRequest,
        security: &SecurityContext,
    ) -> Result<MeshResponse, TransportError> {
        let response = match &security.credentials {
            Some(credentials) => {
                self.send_tls(endpoint, request, &security.target, credentials)
                    .await?
            }
            None => self.send_plain(endpoint, request).await?,
        };

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| {
                warn!(endpoint = %endpoint, "failed to read upstream body: {}", e);
                TransportError::Other(format!("failed to read response body: {}", e))
            })?
            .to_bytes();

        Ok(MeshResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            attempts: 1,
        })
    }
}
