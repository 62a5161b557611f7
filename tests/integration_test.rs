use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use servicemesh_core::api::ControlApi;
use servicemesh_core::balancer::LoadBalancer;
use servicemesh_core::client::MeshClient;
use servicemesh_core::config::RegistryConfig;
use servicemesh_core::control_plane::{ControlPlane, PolicyCache, PolicySource};
use servicemesh_core::health::HealthTracker;
use servicemesh_core::proxy::{ProxyService, HEADER_ATTEMPTS, HEADER_SERVICE};
use servicemesh_core::registry::{InstanceKey, ServiceInstance, ServiceRegistry};
use servicemesh_core::server::HttpServer;
use servicemesh_core::transport::HttpTransport;
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Upstream answering 500 to its first `failures` requests and then its name.
async fn start_mock_upstream(name: &'static str, failures: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            let served = Arc::clone(&served);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<Incoming>| {
                    let n = served.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let status = if n < failures {
                            StatusCode::INTERNAL_SERVER_ERROR
                        } else {
                            StatusCode::OK
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(name)))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    addr
}

struct Node {
    registry: Arc<ServiceRegistry>,
    tracker: Arc<HealthTracker>,
    proxy_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    async fn start() -> Self {
        let tracker = Arc::new(HealthTracker::new(1, 3));
        let registry = Arc::new(ServiceRegistry::new(
            RegistryConfig::default(),
            Arc::clone(&tracker),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
        ));
        let plane = Arc::new(ControlPlane::new());
        let policies = Arc::new(PolicyCache::new(
            plane as Arc<dyn PolicySource>,
            Duration::from_secs(60),
        ));
        let client = Arc::new(MeshClient::new(
            "gateway",
            Arc::clone(&registry),
            balancer,
            policies,
            Arc::new(HttpTransport::default()),
        ));

        let server = HttpServer::bind("proxy", "127.0.0.1:0", ProxyService::new(client))
            .await
            .unwrap();
        let proxy_addr = server.local_addr();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self {
            registry,
            tracker,
            proxy_addr,
            shutdown_tx,
        }
    }

    fn add_healthy(&self, service: &str, instance: &str, addr: SocketAddr) {
        self.registry
            .register(ServiceInstance::new(
                service,
                instance,
                addr.ip().to_string(),
                addr.port(),
            ))
            .unwrap();
        self.tracker.record_success(&InstanceKey::new(service, instance));
    }

    async fn get(&self, service: &str, path: &str) -> (StatusCode, Option<String>, String) {
        let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
        let req = Request::builder()
            .uri(format!("http://{}{}", self.proxy_addr, path))
            .header(HEADER_SERVICE, service)
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = client.request(req).await.unwrap();
        let status = response.status();
        let attempts = response
            .headers()
            .get(HEADER_ATTEMPTS)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, attempts, String::from_utf8(body.to_vec()).unwrap())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_round_robin_across_instances() {
    let node = Node::start().await;
    node.add_healthy("lake", "a", start_mock_upstream("lake-a", 0).await);
    node.add_healthy("lake", "b", start_mock_upstream("lake-b", 0).await);

    let mut seen = HashSet::new();
    for _ in 0..4 {
        let (status, attempts, body) = node.get("lake", "/items").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(attempts.as_deref(), Some("1"));
        seen.insert(body);
    }
    assert_eq!(seen.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_retries_server_errors() {
    let node = Node::start().await;
    node.add_healthy("lake", "a", start_mock_upstream("lake-a", 1).await);

    let (status, attempts, body) = node.get("lake", "/items").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attempts.as_deref(), Some("2"));
    assert_eq!(body, "lake-a");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_unknown_service() {
    let node = Node::start().await;

    let (status, attempts, _) = node.get("nowhere", "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(attempts.as_deref(), Some("0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_api_over_tcp() {
    let registry = Arc::new(ServiceRegistry::new(
        RegistryConfig::default(),
        Arc::new(HealthTracker::new(2, 3)),
    ));
    let plane = Arc::new(ControlPlane::new());
    let server = HttpServer::bind(
        "control",
        "127.0.0.1:0",
        ControlApi::new(Arc::clone(&registry), Arc::clone(&plane)),
    )
    .await
    .unwrap();
    let addr = server.local_addr();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = server.serve(shutdown_rx).await;
    });

    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let send = |method: Method, path: &str, body: &'static str| {
        let req = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", addr, path))
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        client.request(req)
    };

    let response = send(
        Method::POST,
        "/register",
        r#"{"service_id":"lake","instance_id":"i1","host":"10.0.0.1","port":8001}"#,
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(registry.list_instances("lake").len(), 1);

    let response = send(Method::GET, "/services/lake", "").await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let listed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed[0]["instance_id"], "i1");
    assert_eq!(listed[0]["health"], "UNKNOWN");

    let response = send(Method::PUT, "/policy/lake", r#"{"timeout_ms": 250}"#)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(plane.get_policy("lake").timeout_ms, 250);

    let response = send(Method::GET, "/policy/lake?since_version=1", "")
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    let response = send(Method::GET, "/health", "").await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let _ = shutdown_tx.send(());
}
