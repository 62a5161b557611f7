//! Calling services through the mesh client.
//!
//! Starts two local upstreams for `orders`, one of them flaky, and calls them
//! with retries and round-robin balancing. A `payments` service with nothing
//! listening then shows its circuit opening.
//!
//! Run with:
//! ```bash
//! cargo run --example mesh_client
//! ```

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use servicemesh_core::balancer::LoadBalancer;
use servicemesh_core::client::MeshClient;
use servicemesh_core::config::RegistryConfig;
use servicemesh_core::control_plane::{ControlPlane, PolicyCache, PolicySource};
use servicemesh_core::health::HealthTracker;
use servicemesh_core::policy::MeshPolicy;
use servicemesh_core::registry::{ServiceInstance, ServiceRegistry};
use servicemesh_core::retry::RetryPolicy;
use servicemesh_core::transport::{HttpTransport, MeshRequest};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Upstream answering 503 to its first `failures` requests, then its name.
async fn upstream(name: &'static str, failures: usize) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let served = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let served = Arc::clone(&served);
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let n = served.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let mut response = Response::new(Full::new(Bytes::from(name)));
                        if n < failures {
                            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                        }
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    Ok(addr)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

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
        Arc::clone(&plane) as Arc<dyn PolicySource>,
        Duration::from_secs(5),
    ));
    let client = MeshClient::new(
        "gateway",
        Arc::clone(&registry),
        balancer,
        policies,
        Arc::new(HttpTransport::new(Duration::from_millis(500))),
    );

    let instances = [("o1", upstream("o1", 0).await?), ("o2", upstream("o2", 2).await?)];
    for (id, addr) in instances {
        let instance = ServiceInstance::new("orders", id, addr.ip().to_string(), addr.port());
        let key = instance.key();
        registry.register(instance)?;
        tracker.record_success(&key);
        info!(instance = id, %addr, "registered orders instance");
    }
    plane.apply_policy(
        "orders",
        MeshPolicy {
            timeout_ms: 1_000,
            retry_policy: RetryPolicy::new()
                .with_max_attempts(3)
                .with_base_interval(Duration::from_millis(50)),
            ..MeshPolicy::default()
        },
    )?;

    info!("calling orders; o2 fails its first two requests");
    for i in 1..=6 {
        match client.call("orders", MeshRequest::get("/items")).await {
            Ok(response) => info!(
                call = i,
                status = %response.status,
                attempts = response.attempts,
                served_by = %String::from_utf8_lossy(&response.body),
                "call succeeded"
            ),
            Err(e) => warn!(call = i, attempts = e.attempts, error = %e, "call failed"),
        }
    }

    // Nothing listens on the reserved port.
    let closed = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let instance = ServiceInstance::new("payments", "p1", closed.ip().to_string(), closed.port());
    let key = instance.key();
    registry.register(instance)?;
    tracker.record_success(&key);
    let mut policy = MeshPolicy {
        retry_policy: RetryPolicy::no_retries(),
        ..MeshPolicy::default()
    };
    policy.circuit_breaker_policy.failure_threshold = 2;
    plane.apply_policy("payments", policy)?;

    info!("calling payments with nothing listening");
    for i in 1..=3 {
        if let Err(e) = client.call("payments", MeshRequest::get("/charge")).await {
            warn!(call = i, attempts = e.attempts, error = %e, "call failed");
        }
    }
    info!(
        state = ?client.circuit_breaker().state("payments"),
        "payments circuit after three calls"
    );
    Ok(())
}
