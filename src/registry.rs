//! Service registry: registered instances, heartbeats and expiry.
//!
//! The instance map sits behind a read-write lock: `list_instances` and the
//! other queries take the read side, registration, deregistration and the
//! sweep take the write side. No lock is held across an `.await`.

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::health::HealthTracker;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifies one instance of one logical service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub service_id: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(service_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.instance_id)
    }
}

fn default_health_check_endpoint() -> String {
    "/health".to_string()
}

/// One running replica of a logical service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_id: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_health_check_endpoint")]
    pub health_check_endpoint: String,
    /// Free-form labels such as `version` or `zone`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip, default = "Instant::now")]
    pub last_heartbeat: Instant,
    /// Registration order within the service, used for stable tie-breaking.
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl ServiceInstance {
    pub fn new(
        service_id: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            health_check_endpoint: default_health_check_endpoint(),
            metadata: BTreeMap::new(),
            last_heartbeat: Instant::now(),
            sequence: 0,
        }
    }

    /// Sets the health check path.
    pub fn with_health_check_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.health_check_endpoint = endpoint.into();
        self
    }

    /// Adds a metadata label.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.service_id, &self.instance_id)
    }

    /// `host:port` of the instance.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full URI polled by the active health checker.
    pub fn health_check_uri(&self) -> String {
        let path = if self.health_check_endpoint.starts_with('/') {
            self.health_check_endpoint.clone()
        } else {
            format!("/{}", self.health_check_endpoint)
        };
        format!("http://{}{}", self.authority(), path)
    }

    /// Time since the last heartbeat.
    pub fn heartbeat_age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_heartbeat)
    }
}

/// Why an instance left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregistrationReason {
    Explicit,
    Expired,
}

/// Registry membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(InstanceKey),
    Deregistered {
        key: InstanceKey,
        reason: DeregistrationReason,
    },
}

/// Registry of service instances.
///
/// Owned explicitly and shared via `Arc`; there is no process-wide instance.
pub struct ServiceRegistry {
    config: RegistryConfig,
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    health: Arc<HealthTracker>,
    events: broadcast::Sender<RegistryEvent>,
    next_sequence: AtomicU64,
}

impl ServiceRegistry {
    /// Creates an empty registry that reports removals to `health`.
    pub fn new(config: RegistryConfig, health: Arc<HealthTracker>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            services: RwLock::new(HashMap::new()),
            health,
            events,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Returns the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the health tracker the registry reports to.
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Subscribes to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn is_fresh(&self, instance: &ServiceInstance) -> bool {
        instance.heartbeat_age() <= self.config.heartbeat_ttl
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Registers an instance.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateInstance` if the same
    /// `(service_id, instance_id)` is present with a fresh heartbeat. A stale
    /// entry is replaced in place, keeping its registration order.
    pub fn register(&self, mut instance: ServiceInstance) -> Result<(), RegistryError> {
        instance.last_heartbeat = Instant::now();
        let key = instance.key();
        {
            let mut services = self.services.write();
            let instances = services.entry(instance.service_id.clone()).or_default();

            if let Some(existing) = instances
                .iter_mut()
                .find(|i| i.instance_id == instance.instance_id)
            {
                if self.is_fresh(existing) {
                    return Err(RegistryError::DuplicateInstance {
                        service_id: key.service_id,
                        instance_id: key.instance_id,
                    });
                }
                instance.sequence = existing.sequence;
                *existing = instance;
            } else {
                instance.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                instances.push(instance);
            }
        }

        info!(service_id = %key.service_id, instance_id = %key.instance_id, "instance registered");
        self.emit(RegistryEvent::Registered(key));
        Ok(())
    }

    /// Removes an instance.
    pub fn deregister(&self, service_id: &str, instance_id: &str) -> Result<(), RegistryError> {
        let removed = self.remove(service_id, instance_id);
        if !removed {
            return Err(RegistryError::NotFound {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
            });
        }

        let key = InstanceKey::new(service_id, instance_id);
        self.health.forget(&key);
        info!(service_id = %service_id, instance_id = %instance_id, "instance deregistered");
        self.emit(RegistryEvent::Deregistered {
            key,
            reason: DeregistrationReason::Explicit,
        });
        Ok(())
    }

    fn remove(&self, service_id: &str, instance_id: &str) -> bool {
        let mut services = self.services.write();
        let Some(instances) = services.get_mut(service_id) else {
            return false;
        };
        let before = instances.len();
        instances.retain(|i| i.instance_id != instance_id);
        let removed = instances.len() != before;
        if instances.is_empty() {
            services.remove(service_id);
        }
        removed
    }

    /// Refreshes the heartbeat of an instance.
    pub fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<(), RegistryError> {
        let mut services = self.services.write();
        let instance = services
            .get_mut(service_id)
            .and_then(|instances| instances.iter_mut().find(|i| i.instance_id == instance_id))
            .ok_or_else(|| RegistryError::NotFound {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
            })?;
        instance.last_heartbeat = Instant::now();
        debug!(service_id = %service_id, instance_id = %instance_id, "heartbeat");
        Ok(())
    }

    /// Returns the non-stale instances of a service in registration order.
    pub fn list_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        let services = self.services.read();
        let mut live: Vec<ServiceInstance> = services
            .get(service_id)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|i| self.is_fresh(i))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        live.sort_by_key(|i| i.sequence);
        live
    }

    /// Returns an instance regardless of staleness.
    pub fn get(&self, service_id: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.services
            .read()
            .get(service_id)
            .and_then(|instances| instances.iter().find(|i| i.instance_id == instance_id))
            .cloned()
    }

    /// Names of all services with at least one registered instance.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All non-stale instances across every service.
    pub fn snapshot(&self) -> Vec<ServiceInstance> {
        let services = self.services.read();
        services
            .values()
            .flat_map(|instances| instances.iter().filter(|i| self.is_fresh(i)).cloned())
            .collect()
    }

    /// Upserts instances of `service_id` learned from the discovery backend.
    ///
    /// Unlike `register`, a fresh duplicate is simply refreshed.
    pub fn ingest(&self, service_id: &str, instances: Vec<ServiceInstance>) -> usize {
        let mut added = Vec::new();
        let count = instances.len();
        {
            let mut services = self.services.write();
            for mut instance in instances {
                instance.service_id = service_id.to_string();
                instance.last_heartbeat = Instant::now();
                let entries = services.entry(instance.service_id.clone()).or_default();
                match entries
                    .iter_mut()
                    .find(|i| i.instance_id == instance.instance_id)
                {
                    Some(existing) => {
                        instance.sequence = existing.sequence;
                        *existing = instance;
                    }
                    None => {
                        instance.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                        added.push(instance.key());
                        entries.push(instance);
                    }
                }
            }
        }

        for key in added {
            debug!(instance = %key, "instance ingested from discovery");
            self.emit(RegistryEvent::Registered(key));
        }
        count
    }

    /// Removes every instance whose heartbeat is older than
    /// `deregister_critical_service_after` and returns their keys.
    pub fn sweep_expired(&self) -> Vec<InstanceKey> {
        let limit = self.config.deregister_critical_service_after;
        let mut expired = Vec::new();
        {
            let mut services = self.services.write();
            for instances in services.values_mut() {
                instances.retain(|i| {
                    let keep = i.heartbeat_age() <= limit;
                    if !keep {
                        expired.push(i.key());
                    }
                    keep
                });
            }
            services.retain(|_, instances| !instances.is_empty());
        }

        for key in &expired {
            self.health.forget(key);
            warn!(instance = %key, "instance expired after missed heartbeats");
            self.emit(RegistryEvent::Deregistered {
                key: key.clone(),
                reason: DeregistrationReason::Expired,
            });
        }
        expired
    }

    /// Runs the expiry sweep until a shutdown signal is received.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.sweep_expired();
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "registry sweep removed instances");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping registry sweep");
                    break;
                }
            }
        }
    }
}
