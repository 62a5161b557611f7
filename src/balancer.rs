//! Health-aware load balancing over registry instances.
//!
//! Candidates are the live instances of a service that the health tracker
//! reports as healthy and whose effective weight is non-zero. Strategies are
//! chosen per service from the closed [`Strategy`] enum.

use crate::error::BalancerError;
use crate::health::HealthTracker;
use crate::policy::TrafficPolicy;
use crate::registry::{ServiceInstance, ServiceRegistry};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Virtual nodes placed on the hash ring per endpoint.
pub const VIRTUAL_NODES: usize = 64;

/// Load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    /// Hash of a caller-supplied routing key; round robin without a key.
    ConsistentHash,
}

/// Load-balancing view of one instance.
#[derive(Debug)]
pub struct ServiceEndpoint {
    pub service_id: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    weight: AtomicU32,
    current_connections: AtomicUsize,
}

impl ServiceEndpoint {
    pub fn new(instance: &ServiceInstance, weight: u32) -> Self {
        Self {
            service_id: instance.service_id.clone(),
            instance_id: instance.instance_id.clone(),
            host: instance.host.clone(),
            port: instance.port,
            weight: AtomicU32::new(weight),
            current_connections: AtomicUsize::new(0),
        }
    }

    /// `host:port` of the endpoint.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Returns the number of calls currently in flight.
    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.current_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the in-flight count, saturating at zero.
    fn release(&self) {
        let _ = self
            .current_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}:{}", self.service_id, self.instance_id, self.host, self.port)
    }
}

/// Holds one connection reservation and releases it when dropped.
#[derive(Debug)]
pub struct EndpointLease {
    endpoint: Arc<ServiceEndpoint>,
    released: bool,
}

impl EndpointLease {
    pub fn endpoint(&self) -> &Arc<ServiceEndpoint> {
        &self.endpoint
    }

    /// Releases the reservation now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.endpoint.release();
        }
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Per-endpoint counters returned by [`LoadBalancer::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub instance_id: String,
    pub address: String,
    pub weight: u32,
    pub current_connections: usize,
}

/// Precomputed ring of virtual nodes.
#[derive(Debug, Default)]
struct HashRing {
    members: Vec<String>,
    ring: BTreeMap<u64, String>,
}

impl HashRing {
    fn build(members: Vec<String>) -> Self {
        let mut ring = BTreeMap::new();
        for id in &members {
            for vnode in 0..VIRTUAL_NODES {
                ring.insert(hash64(format!("{}#{}", id, vnode).as_bytes()), id.clone());
            }
        }
        Self { members, ring }
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        let point = hash64(key.as_bytes());
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, id)| id.as_str())
    }
}

/// First eight bytes of the SHA-256 digest.
fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Default)]
struct ServicePool {
    strategy: Strategy,
    version_weights: BTreeMap<String, u32>,
    cursor: usize,
    endpoints: HashMap<String, Arc<ServiceEndpoint>>,
    current_weights: HashMap<String, i64>,
    ring: HashRing,
}

impl ServicePool {
    fn weight_of(&self, instance: &ServiceInstance) -> u32 {
        TrafficPolicy::effective_weight(&self.version_weights, instance)
    }

    /// Refreshes the endpoint table from the live instance list and returns
    /// the endpoints of `healthy`, in registration order.
    fn sync(
        &mut self,
        live: &[ServiceInstance],
        healthy: &[&ServiceInstance],
    ) -> Vec<Arc<ServiceEndpoint>> {
        self.endpoints.retain(|id, endpoint| {
            endpoint.current_connections() > 0 || live.iter().any(|i| &i.instance_id == id)
        });

        let mut candidates = Vec::with_capacity(healthy.len());
        for instance in healthy {
            let weight = self.weight_of(instance);
            if weight == 0 {
                continue;
            }
            let endpoint = match self.endpoints.get(&instance.instance_id) {
                Some(existing)
                    if existing.host == instance.host && existing.port == instance.port =>
                {
                    existing.weight.store(weight, Ordering::Relaxed);
                    Arc::clone(existing)
                }
                _ => {
                    let endpoint = Arc::new(ServiceEndpoint::new(instance, weight));
                    self.endpoints
                        .insert(instance.instance_id.clone(), Arc::clone(&endpoint));
                    endpoint
                }
            };
            candidates.push(endpoint);
        }
        candidates
    }

    fn round_robin(&mut self, candidates: &[Arc<ServiceEndpoint>]) -> Arc<ServiceEndpoint> {
        let idx = self.cursor % candidates.len();
        self.cursor = self.cursor.wrapping_add(1);
        Arc::clone(&candidates[idx])
    }

    fn least_connections(candidates: &[Arc<ServiceEndpoint>]) -> Arc<ServiceEndpoint> {
        // Strict comparison: ties go to the earliest registered.
        let mut best = &candidates[0];
        for endpoint in &candidates[1..] {
            if endpoint.current_connections() < best.current_connections() {
                best = endpoint;
            }
        }
        Arc::clone(best)
    }

    /// Smooth weighted round robin: every candidate gains its weight, the
    /// largest running total wins and pays back the sum of all weights.
    fn weighted_round_robin(&mut self, candidates: &[Arc<ServiceEndpoint>]) -> Arc<ServiceEndpoint> {
        self.current_weights
            .retain(|id, _| candidates.iter().any(|e| &e.instance_id == id));

        let total: i64 = candidates.iter().map(|e| i64::from(e.weight())).sum();
        let mut best: Option<(usize, i64)> = None;
        for (idx, endpoint) in candidates.iter().enumerate() {
            let current = self
                .current_weights
                .entry(endpoint.instance_id.clone())
                .or_insert(0);
            *current += i64::from(endpoint.weight());
            if best.map_or(true, |(_, w)| *current > w) {
                best = Some((idx, *current));
            }
        }

        let idx = best.map(|(idx, _)| idx).unwrap_or(0);
        let chosen = &candidates[idx];
        if let Some(current) = self.current_weights.get_mut(&chosen.instance_id) {
            *current -= total;
        }
        Arc::clone(chosen)
    }

    fn consistent_hash(
        &mut self,
        candidates: &[Arc<ServiceEndpoint>],
        key: &str,
    ) -> Arc<ServiceEndpoint> {
        let members: Vec<String> = candidates.iter().map(|e| e.instance_id.clone()).collect();
        if self.ring.members != members {
            debug!(members = members.len(), "rebuilding hash ring");
            self.ring = HashRing::build(members);
        }
        let chosen = self
            .ring
            .lookup(key)
            .and_then(|id| candidates.iter().find(|e| e.instance_id == id));
        match chosen {
            Some(endpoint) => Arc::clone(endpoint),
            None => Arc::clone(&candidates[0]),
        }
    }
}

/// Load balancer for every service in the registry.
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    health: Arc<HealthTracker>,
    pools: DashMap<String, Arc<Mutex<ServicePool>>>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ServiceRegistry>, health: Arc<HealthTracker>) -> Self {
        Self {
            registry,
            health,
            pools: DashMap::new(),
        }
    }

    fn pool(&self, service_id: &str) -> Arc<Mutex<ServicePool>> {
        if let Some(pool) = self.pools.get(service_id) {
            return Arc::clone(pool.value());
        }
        Arc::clone(self.pools.entry(service_id.to_string()).or_default().value())
    }

    /// Sets the strategy used for a service.
    pub fn set_strategy(&self, service_id: &str, strategy: Strategy) {
        let pool = self.pool(service_id);
        let mut pool = pool.lock();
        if pool.strategy != strategy {
            debug!(service_id = %service_id, ?strategy, "load balancing strategy changed");
            pool.strategy = strategy;
        }
    }

    /// Returns the strategy of a service.
    pub fn strategy(&self, service_id: &str) -> Strategy {
        self.pool(service_id).lock().strategy
    }

    /// Applies the traffic section of a mesh policy: strategy override and
    /// per-version weights.
    pub fn apply_traffic_policy(&self, service_id: &str, traffic: &TrafficPolicy) {
        let pool = self.pool(service_id);
        let mut pool = pool.lock();
        if let Some(strategy) = traffic.load_balancing {
            pool.strategy = strategy;
        }
        if pool.version_weights != traffic.version_weights {
            pool.version_weights = traffic.version_weights.clone();
        }
    }

    /// Selects an endpoint of `service_id` from the registry's live instances.
    pub fn select_endpoint(
        &self,
        service_id: &str,
        routing_key: Option<&str>,
    ) -> Result<Arc<ServiceEndpoint>, BalancerError> {
        let instances = self.registry.list_instances(service_id);
        self.select_from(service_id, &instances, routing_key)
    }

    /// Selects an endpoint among already resolved instances.
    ///
    /// Only healthy instances with a non-zero weight are eligible. The
    /// returned endpoint's connection count has been incremented and must be
    /// given back with [`release`](Self::release).
    pub fn select_from(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        routing_key: Option<&str>,
    ) -> Result<Arc<ServiceEndpoint>, BalancerError> {
        let healthy: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|i| self.health.is_healthy(&i.key()))
            .collect();

        let pool = self.pool(service_id);
        let endpoint = {
            let mut pool = pool.lock();
            let candidates = pool.sync(instances, &healthy);
            if candidates.is_empty() {
                None
            } else {
                let endpoint = match (pool.strategy, routing_key) {
                    (Strategy::RoundRobin, _) | (Strategy::ConsistentHash, None) => {
                        pool.round_robin(&candidates)
                    }
                    (Strategy::LeastConnections, _) => ServicePool::least_connections(&candidates),
                    (Strategy::WeightedRoundRobin, _) => pool.weighted_round_robin(&candidates),
                    (Strategy::ConsistentHash, Some(key)) => pool.consistent_hash(&candidates, key),
                };
                endpoint.acquire();
                Some(endpoint)
            }
        };

        endpoint.ok_or_else(|| {
            warn!(service_id = %service_id, registered = instances.len(), "no healthy endpoint");
            BalancerError::NoHealthyEndpoint {
                service_id: service_id.to_string(),
            }
        })
    }

    /// Like [`select_endpoint`](Self::select_endpoint), returning a lease
    /// that releases the endpoint on drop.
    pub fn lease(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        routing_key: Option<&str>,
    ) -> Result<EndpointLease, BalancerError> {
        self.select_from(service_id, instances, routing_key)
            .map(|endpoint| EndpointLease {
                endpoint,
                released: false,
            })
    }

    /// Gives back the connection reserved by a selection.
    pub fn release(&self, endpoint: &ServiceEndpoint) {
        endpoint.release();
    }

    /// Connection counters of a service's known endpoints.
    pub fn stats(&self, service_id: &str) -> Vec<EndpointStats> {
        let Some(pool) = self.pools.get(service_id).map(|p| Arc::clone(p.value())) else {
            return Vec::new();
        };
        let pool = pool.lock();
        let mut stats: Vec<EndpointStats> = pool
            .endpoints
            .values()
            .map(|e| EndpointStats {
                instance_id: e.instance_id.clone(),
                address: e.address(),
                weight: e.weight(),
                current_connections: e.current_connections(),
            })
            .collect();
        stats.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        stats
    }
}
