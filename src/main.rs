use servicemesh_core::api::ControlApi;
use servicemesh_core::balancer::LoadBalancer;
use servicemesh_core::client::MeshClient;
use servicemesh_core::config::MeshConfig;
use servicemesh_core::control_plane::{ControlPlane, PolicyCache, PolicySource};
use servicemesh_core::discovery::{ConsulCatalog, DiscoverySync};
use servicemesh_core::health::{HealthChecker, HealthTracker, HttpProbe};
use servicemesh_core::proxy::ProxyService;
use servicemesh_core::registry::ServiceRegistry;
use servicemesh_core::security::{LocalCertificateAuthority, SecurityLayer};
use servicemesh_core::server::{HttpServer, TlsSlot};
use servicemesh_core::token::{CachingValidator, JwtValidator, TokenValidator};
use servicemesh_core::transport::HttpTransport;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting service mesh node");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = MeshConfig::from_env_validated()?;
    info!(
        "config: service={}, proxy={}, control={}, admin={}, tls={}",
        config.service_id,
        config.proxy_addr,
        config.control_addr,
        config.admin_addr,
        config.security.tls_enabled
    );

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let tracker = Arc::new(HealthTracker::from_config(&config.health));
    let registry = Arc::new(ServiceRegistry::new(
        config.registry.clone(),
        Arc::clone(&tracker),
    ));
    let balancer = Arc::new(LoadBalancer::new(
        Arc::clone(&registry),
        Arc::clone(&tracker),
    ));
    let plane = Arc::new(ControlPlane::new());
    let policies = Arc::new(PolicyCache::new(
        Arc::clone(&plane) as Arc<dyn PolicySource>,
        config.policy_refresh,
    ));

    let token_cache = config.security.jwt_secret.as_ref().map(|secret| {
        let jwt: Arc<dyn TokenValidator> = Arc::new(JwtValidator::new(secret.as_bytes()));
        Arc::new(CachingValidator::new(jwt, config.security.token_cache_ttl))
    });
    let tokens = token_cache
        .clone()
        .map(|cache| cache as Arc<dyn TokenValidator>);
    let authority = match (&config.security.ca_cert_path, &config.security.ca_key_path) {
        (Some(cert), Some(key)) => LocalCertificateAuthority::load(cert, key)?,
        _ => LocalCertificateAuthority::generate(&format!("{} mesh root", config.service_id))?,
    };
    let security = Arc::new(SecurityLayer::new(
        config.security.clone(),
        Arc::new(authority),
        tokens,
    ));
    security.establish_mtls(&config.service_id).await?;

    let client = Arc::new(
        MeshClient::new(
            config.service_id.clone(),
            Arc::clone(&registry),
            Arc::clone(&balancer),
            Arc::clone(&policies),
            Arc::new(HttpTransport::default()),
        )
        .with_security(Arc::clone(&security)),
    );
    let mut proxy_service = ProxyService::new(Arc::clone(&client));
    if config.security.verify_inbound {
        proxy_service = proxy_service.with_inbound_verification(Arc::clone(&security));
    }

    let mut proxy_server = HttpServer::bind("proxy", &config.proxy_addr, proxy_service).await?;
    let control_server = HttpServer::bind(
        "control",
        &config.control_addr,
        ControlApi::new(Arc::clone(&registry), Arc::clone(&plane)),
    )
    .await?;
    let admin_server =
        HttpServer::bind("admin", &config.admin_addr, ControlApi::admin_only()).await?;

    let mut tasks = JoinSet::new();

    if config.security.tls_enabled {
        let slot = TlsSlot::new();
        slot.install(&security, &config.service_id)?;
        proxy_server = proxy_server.with_tls(slot.clone());
        tasks.spawn({
            let follow = slot.follow_rotations(
                Arc::clone(&security),
                config.service_id.clone(),
                security.subscribe_rotations(),
                shutdown_tx.subscribe(),
            );
            async move {
                follow.await;
                "tls rotation"
            }
        });
    }

    info!("proxy listening on {}", proxy_server.local_addr());
    info!("control API on {}", control_server.local_addr());
    info!("admin endpoints on {} (/health, /metrics)", admin_server.local_addr());

    tasks.spawn({
        let serve = proxy_server.serve(shutdown_tx.subscribe());
        async move {
            if let Err(e) = serve.await {
                error!("proxy listener error: {}", e);
            }
            "proxy"
        }
    });
    tasks.spawn({
        let serve = control_server.serve(shutdown_tx.subscribe());
        async move {
            if let Err(e) = serve.await {
                error!("control listener error: {}", e);
            }
            "control"
        }
    });
    tasks.spawn({
        let serve = admin_server.serve(shutdown_tx.subscribe());
        async move {
            if let Err(e) = serve.await {
                error!("admin listener error: {}", e);
            }
            "admin"
        }
    });

    tasks.spawn({
        let sweep = Arc::clone(&registry).run_sweeper(shutdown_tx.subscribe());
        async move {
            sweep.await;
            "registry sweep"
        }
    });
    tasks.spawn({
        let checker = HealthChecker::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::new(HttpProbe::new()),
            &config.health,
        );
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            checker.run(shutdown_rx).await;
            "health checker"
        }
    });
    tasks.spawn({
        let rotation = Arc::clone(&security).run_rotation(shutdown_tx.subscribe());
        async move {
            rotation.await;
            "certificate rotation"
        }
    });
    if let Some(cache) = token_cache {
        let eviction = cache.run_eviction(config.security.token_cache_ttl, shutdown_tx.subscribe());
        tasks.spawn(async move {
            eviction.await;
            "token cache eviction"
        });
    }
    tasks.spawn({
        let refresh = Arc::clone(&policies).run(Some(plane.subscribe()), shutdown_tx.subscribe());
        async move {
            refresh.await;
            "policy refresh"
        }
    });

    if let Some(url) = &config.discovery_url {
        let sync = DiscoverySync::new(
            Arc::new(ConsulCatalog::new(url)?),
            Arc::clone(&registry),
            config.discovery_services.clone(),
            config.registry.sweep_interval,
        );
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            sync.run(shutdown_rx).await;
            "discovery sync"
        });
        info!("discovery backend at {}", url);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        Some(res) = tasks.join_next() => {
            match res {
                Ok(name) => info!("{} task completed", name),
                Err(err) => error!("task join error: {}", err),
            }
        }
    }

    let _ = shutdown_tx.send(());

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(name) => info!("{} task completed", name),
            Err(err) => error!("task join error: {}", err),
        }
    }

    info!("shutdown complete");
    Ok(())
}
