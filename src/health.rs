//! Instance health tracking with hysteresis, and active health probing.
//!
//! The [`HealthTracker`] owns one [`HealthState`] per instance. A status only
//! flips after a run of identical outcomes:
//! - **Healthy** after `healthy_threshold` consecutive successes
//! - **Unhealthy** after `unhealthy_threshold` consecutive failures
//!
//! Every instance starts as **Unknown**. The load balancer and circuit
//! breaker only read this state.

use crate::config::HealthConfig;
use crate::metrics::Metrics;
use crate::registry::{InstanceKey, ServiceInstance, ServiceRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Health status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Numeric code exported through the `mesh_endpoint_health` gauge.
    pub fn metric_code(self) -> i64 {
        match self {
            HealthStatus::Healthy => 1,
            HealthStatus::Unhealthy => 0,
            HealthStatus::Unknown => -1,
        }
    }
}

/// Per-instance health record.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_checked: Option<Instant>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_checked: None,
        }
    }
}

impl HealthState {
    fn observe(&mut self, healthy: bool, healthy_threshold: u32, unhealthy_threshold: u32) {
        self.last_checked = Some(Instant::now());
        if healthy {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if self.status != HealthStatus::Healthy
                && self.consecutive_successes >= healthy_threshold
            {
                self.status = HealthStatus::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.status != HealthStatus::Unhealthy
                && self.consecutive_failures >= unhealthy_threshold
            {
                self.status = HealthStatus::Unhealthy;
            }
        }
    }
}

/// Owner of all instance health state.
#[derive(Debug)]
pub struct HealthTracker {
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    states: DashMap<InstanceKey, HealthState>,
}

impl HealthTracker {
    /// Creates a tracker with the given hysteresis thresholds.
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
            states: DashMap::new(),
        }
    }

    /// Creates a tracker from the health section of the mesh config.
    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.healthy_threshold, config.unhealthy_threshold)
    }

    /// Records a successful check and returns the resulting status.
    pub fn record_success(&self, key: &InstanceKey) -> HealthStatus {
        self.observe(key, true)
    }

    /// Records a failed check and returns the resulting status.
    pub fn record_failure(&self, key: &InstanceKey) -> HealthStatus {
        self.observe(key, false)
    }

    fn observe(&self, key: &InstanceKey, healthy: bool) -> HealthStatus {
        let (before, after) = {
            let mut state = self.states.entry(key.clone()).or_default();
            let before = state.status;
            state.observe(healthy, self.healthy_threshold, self.unhealthy_threshold);
            (before, state.status)
        };

        if before != after {
            match after {
                HealthStatus::Unhealthy => warn!(
                    service_id = %key.service_id,
                    instance_id = %key.instance_id,
                    from = ?before,
                    "instance became unhealthy"
                ),
                _ => info!(
                    service_id = %key.service_id,
                    instance_id = %key.instance_id,
                    from = ?before,
                    to = ?after,
                    "instance health changed"
                ),
            }
            Metrics::set_endpoint_health(&key.service_id, &key.instance_id, after.metric_code());
        }
        after
    }

    /// Returns the current status, `Unknown` for untracked instances.
    pub fn status(&self, key: &InstanceKey) -> HealthStatus {
        self.states
            .get(key)
            .map(|s| s.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Returns true only for instances whose status is `Healthy`.
    pub fn is_healthy(&self, key: &InstanceKey) -> bool {
        self.status(key) == HealthStatus::Healthy
    }

    /// Returns a copy of the instance's health record.
    pub fn state(&self, key: &InstanceKey) -> Option<HealthState> {
        self.states.get(key).map(|s| s.clone())
    }

    /// Drops all state for an instance.
    pub fn forget(&self, key: &InstanceKey) {
        if self.states.remove(key).is_some() {
            Metrics::remove_endpoint_health(&key.service_id, &key.instance_id);
        }
    }

    /// Number of tracked instances.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no instance is tracked.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// A single health probe against an instance.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns true if the instance answered healthy.
    async fn probe(&self, instance: &ServiceInstance) -> bool;
}

/// Probes `GET http://host:port<health_check_endpoint>`; only 200 is healthy.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, instance: &ServiceInstance) -> bool {
        let uri = match instance.health_check_uri().parse::<http::Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "invalid health check uri");
                return false;
            }
        };

        match self.client.get(uri).await {
            Ok(response) => response.status() == http::StatusCode::OK,
            Err(e) => {
                debug!(instance_id = %instance.instance_id, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Background task that probes every live instance on a fixed interval.
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    tracker: Arc<HealthTracker>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        tracker: Arc<HealthTracker>,
        probe: Arc<dyn HealthProbe>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            registry,
            tracker,
            probe,
            interval: config.interval,
            timeout: config.timeout,
        }
    }

    /// Probes every live instance once, concurrently. Each probe is bounded
    /// by the configured timeout; a timeout counts as a failure. Results for
    /// instances deregistered while their probe ran are dropped.
    pub async fn check_all(&self) {
        let instances = self.registry.snapshot();
        let mut probes = JoinSet::new();

        for instance in instances {
            let probe = Arc::clone(&self.probe);
            let timeout = self.timeout;
            probes.spawn(async move {
                let healthy = tokio::time::timeout(timeout, probe.probe(&instance))
                    .await
                    .unwrap_or(false);
                (instance.key(), healthy)
            });
        }

        while let Some(result) = probes.join_next().await {
            match result {
                Ok((key, _)) if self.registry.get(&key.service_id, &key.instance_id).is_none() => {
                    debug!(instance = %key, "instance left during health check, dropping result");
                }
                Ok((key, true)) => {
                    self.tracker.record_success(&key);
                }
                Ok((key, false)) => {
                    self.tracker.record_failure(&key);
                }
                Err(e) => warn!("health probe task failed: {}", e),
            }
        }
    }

    /// Runs probes until a shutdown signal is received.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis() as u64, "health checker started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping health checker");
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
    use std::collections::HashSet;

    fn key(instance: &str) -> InstanceKey {
        InstanceKey::new("health-svc", instance)
    }

    #[test]
    fn test_initial_status_unknown() {
        let tracker = HealthTracker::new(2, 3);
        assert_eq!(tracker.status(&key("h0")), HealthStatus::Unknown);
        assert!(!tracker.is_healthy(&key("h0")));
    }

    #[test]
    fn test_becomes_healthy_after_threshold() {
        let tracker = HealthTracker::new(2, 3);
        let k = key("h1");
        assert_eq!(tracker.record_success(&k), HealthStatus::Unknown);
        assert_eq!(tracker.record_success(&k), HealthStatus::Healthy);
    }

    #[test]
    fn test_unhealthy_after_exact_failure_streak() {
        let tracker = HealthTracker::new(1, 3);
        let k = key("h2");
        tracker.record_success(&k);
        assert_eq!(tracker.status(&k), HealthStatus::Healthy);

        assert_eq!(tracker.record_failure(&k), HealthStatus::Healthy);
        assert_eq!(tracker.record_failure(&k), HealthStatus::Healthy);
        assert_eq!(tracker.record_failure(&k), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_interleaved_results_do_not_flip() {
        let tracker = HealthTracker::new(2, 3);
        let k = key("h3");
        tracker.record_success(&k);
        tracker.record_success(&k);
        assert_eq!(tracker.status(&k), HealthStatus::Healthy);

        for _ in 0..10 {
            tracker.record_failure(&k);
            tracker.record_failure(&k);
            tracker.record_success(&k);
        }
        assert_eq!(tracker.status(&k), HealthStatus::Healthy);

        tracker.record_failure(&k);
        tracker.record_failure(&k);
        tracker.record_failure(&k);
        assert_eq!(tracker.status(&k), HealthStatus::Unhealthy);

        for _ in 0..10 {
            tracker.record_success(&k);
            tracker.record_failure(&k);
        }
        assert_eq!(tracker.status(&k), HealthStatus::Unhealthy);

        tracker.record_success(&k);
        assert_eq!(tracker.status(&k), HealthStatus::Unhealthy);
        tracker.record_success(&k);
        assert_eq!(tracker.status(&k), HealthStatus::Healthy);
    }

    #[test]
    fn test_state_counters() {
        let tracker = HealthTracker::new(2, 3);
        let k = key("h4");
        tracker.record_failure(&k);
        tracker.record_failure(&k);

        let state = tracker.state(&k).unwrap();
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.consecutive_successes, 0);
        assert!(state.last_checked.is_some());

        tracker.forget(&k);
        assert!(tracker.state(&k).is_none());
    }

    struct FixedProbe {
        healthy: HashSet<String>,
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self, instance: &ServiceInstance) -> bool {
            self.healthy.contains(&instance.instance_id)
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _instance: &ServiceInstance) -> bool {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        }
    }

    /// Deregisters the instance it is asked about, then reports it down.
    #[derive(Default)]
    struct SelfRemovingCheck {
        registry: parking_lot::Mutex<Option<Arc<ServiceRegistry>>>,
    }

    #[async_trait]
    impl HealthProbe for SelfRemovingCheck {
        async fn probe(&self, instance: &ServiceInstance) -> bool {
            let registry = self.registry.lock().clone();
            if let Some(registry) = registry {
                registry
                    .deregister(&instance.service_id, &instance.instance_id)
                    .unwrap();
            }
            false
        }
    }

    fn setup(
        probe: Arc<dyn HealthProbe>,
    ) -> (Arc<ServiceRegistry>, Arc<HealthTracker>, HealthChecker) {
        let tracker = Arc::new(HealthTracker::new(1, 2));
        let registry = Arc::new(ServiceRegistry::new(
            RegistryConfig::default(),
            Arc::clone(&tracker),
        ));
        let config = HealthConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            healthy_threshold: 1,
            unhealthy_threshold: 2,
        };
        let checker = HealthChecker::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            probe,
            &config,
        );
        (registry, tracker, checker)
    }

    #[tokio::test]
    async fn test_checker_feeds_tracker() {
        let probe = Arc::new(FixedProbe {
            healthy: ["up".to_string()].into_iter().collect(),
        });
        let (registry, tracker, checker) = setup(probe);
        registry
            .register(ServiceInstance::new("probe-svc", "up", "10.0.0.1", 8001))
            .unwrap();
        registry
            .register(ServiceInstance::new("probe-svc", "down", "10.0.0.2", 8001))
            .unwrap();

        checker.check_all().await;
        checker.check_all().await;

        assert_eq!(
            tracker.status(&InstanceKey::new("probe-svc", "up")),
            HealthStatus::Healthy
        );
        assert_eq!(
            tracker.status(&InstanceKey::new("probe-svc", "down")),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let (registry, tracker, checker) = setup(Arc::new(HangingProbe));
        registry
            .register(ServiceInstance::new("slow-svc", "s1", "10.0.0.3", 8001))
            .unwrap();

        checker.check_all().await;
        let state = tracker.state(&InstanceKey::new("slow-svc", "s1")).unwrap();
        assert_eq!(state.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_results_for_departed_instances_are_dropped() {
        let check = Arc::new(SelfRemovingCheck::default());
        let (registry, tracker, checker) = setup(check.clone());
        *check.registry.lock() = Some(Arc::clone(&registry));
        registry
            .register(ServiceInstance::new("gone-svc", "g1", "10.0.0.4", 8001))
            .unwrap();

        checker.check_all().await;

        assert!(registry.get("gone-svc", "g1").is_none());
        assert!(tracker.state(&InstanceKey::new("gone-svc", "g1")).is_none());
        assert!(tracker.is_empty());
    }
}
