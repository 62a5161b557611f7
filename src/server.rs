//! HTTP/1.1 listener shared by the proxy, control API and admin endpoints.
//!
//! Each accepted connection is served on its own task. With a TLS acceptor
//! installed the listener terminates mutual TLS; the acceptor can be swapped
//! at runtime, so rotated certificates only affect new connections.

use crate::error::{ProxyError, Result};
use crate::security::{RotationEvent, SecurityLayer};
use crate::tls;
use http::header::CONTENT_TYPE;
use http::{Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// Body type of every response produced by the mesh's HTTP services.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Builds a response with a fixed body.
pub fn full_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(
            Full::new(body.into())
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| Response::new(Empty::new().map_err(|never| match never {}).boxed()))
}

/// Plain-text error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    full_response(status, "text/plain", message.to_string())
}

/// Empty response with a status only.
pub fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(Empty::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}

/// Swappable TLS acceptor. Cloning shares the slot.
#[derive(Clone, Default)]
pub struct TlsSlot {
    acceptor: Arc<RwLock<Option<TlsAcceptor>>>,
}

impl TlsSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `acceptor` for connections accepted from now on.
    pub fn set(&self, acceptor: TlsAcceptor) {
        *self.acceptor.write() = Some(acceptor);
    }

    pub fn current(&self) -> Option<TlsAcceptor> {
        self.acceptor.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.acceptor.read().is_some()
    }

    /// Installs an acceptor for the current credentials of `service_id`.
    pub fn install(&self, security: &SecurityLayer, service_id: &str) -> Result<()> {
        let credentials = security.current(service_id).ok_or_else(|| {
            ProxyError::InvalidConfig(format!("no credentials issued for {}", service_id))
        })?;
        self.set(tls::acceptor(&credentials)?);
        Ok(())
    }

    /// Reinstalls the acceptor whenever `service_id` is rotated, until
    /// shutdown.
    pub async fn follow_rotations(
        self,
        security: Arc<SecurityLayer>,
        service_id: String,
        mut rotations: broadcast::Receiver<RotationEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = rotations.recv() => match event {
                    Ok(event) if event.service_id == service_id => {
                        match self.install(&security, &service_id) {
                            Ok(()) => info!(service_id = %service_id, key_id = %event.key_id, "TLS acceptor rotated"),
                            Err(e) => error!(service_id = %service_id, "failed to rotate TLS acceptor: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed rotation events, reinstalling acceptor");
                        if let Err(e) = self.install(&security, &service_id) {
                            error!(service_id = %service_id, "failed to rotate TLS acceptor: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

/// HTTP/1.1 listener serving one tower service.
///
/// # Example
///
/// ```no_run
/// use servicemesh_core::api::ControlApi;
/// use servicemesh_core::server::HttpServer;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let server = HttpServer::bind("admin", "127.0.0.1:15000", ControlApi::admin_only()).await?;
///     server.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct HttpServer<S> {
    name: &'static str,
    tcp_listener: TcpListener,
    service: S,
    addr: SocketAddr,
    tls: TlsSlot,
}

impl<S> HttpServer<S>
where
    S: Service<Request<Incoming>, Response = Response<ResponseBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    /// Binds to `addr`.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(service))]
    pub async fn bind(name: &'static str, addr: &str, service: S) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("{} bound to {}", name, local_addr);

        Ok(Self {
            name,
            tcp_listener,
            service,
            addr: local_addr,
            tls: TlsSlot::new(),
        })
    }

    /// Terminates TLS with the acceptor held in `slot`.
    pub fn with_tls(mut self, slot: TlsSlot) -> Self {
        self.tls = slot;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_enabled()
    }

    /// Serves connections until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(name = self.name, addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let service = self.service.clone();
                            let acceptor = self.tls.current();
                            let name = self.name;

                            tokio::spawn(async move {
                                let result = match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls_stream) => Self::serve_http1(TokioIo::new(tls_stream), service).await,
                                        Err(e) => Err(ProxyError::TlsHandshake(e.to_string())),
                                    },
                                    None => Self::serve_http1(TokioIo::new(stream), service).await,
                                };

                                if let Err(e) = result {
                                    error!("{} connection error from {}: {}", name, peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping {}", self.name);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn serve_http1<I>(io: TokioIo<I>, service: S) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let mut svc = service.clone();
            async move { svc.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(ProxyError::Http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ControlApi;
    use crate::config::SecurityConfig;
    use crate::security::LocalCertificateAuthority;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind() {
        let server = HttpServer::bind("admin", "127.0.0.1:0", ControlApi::admin_only()).await;
        assert!(server.is_ok());
        let server = server.unwrap();
        assert!(!server.is_tls_enabled());
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_invalid_address() {
        let server = HttpServer::bind("admin", "999.999.999.999:0", ControlApi::admin_only()).await;
        assert!(matches!(server, Err(ProxyError::ListenerBind { .. })));
    }

    #[tokio::test]
    async fn test_tls_slot_follows_rotation() {
        let security = Arc::new(SecurityLayer::new(
            SecurityConfig::default(),
            Arc::new(LocalCertificateAuthority::generate("server-test-root").unwrap()),
            None,
        ));
        let slot = TlsSlot::new();
        assert!(slot.install(&security, "lake").is_err());

        security.establish_mtls("lake").await.unwrap();
        slot.install(&security, "lake").unwrap();
        assert!(slot.is_enabled());

        let (shutdown_tx, _) = broadcast::channel(1);
        let follower = tokio::spawn(slot.clone().follow_rotations(
            Arc::clone(&security),
            "lake".to_string(),
            security.subscribe_rotations(),
            shutdown_tx.subscribe(),
        ));
        security.rotate("lake").await.unwrap();
        tokio::task::yield_now().await;
        shutdown_tx.send(()).unwrap();
        follower.await.unwrap();
        assert!(slot.is_enabled());
    }

    #[test]
    fn test_responses() {
        let response = error_response(StatusCode::NOT_FOUND, "Not Found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(empty_response(StatusCode::NO_CONTENT).status(), StatusCode::NO_CONTENT);
    }
}
