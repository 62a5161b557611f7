//! Configuration for the mesh node.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A listener address could not be parsed.
    #[error("invalid {name} address '{addr}': {reason}")]
    InvalidAddr {
        name: &'static str,
        addr: String,
        reason: String,
    },

    /// Two listeners were given the same address.
    #[error("listener addresses must differ: {addr}")]
    DuplicateAddrs { addr: String },

    /// The service identity is empty.
    #[error("service id must not be empty")]
    EmptyServiceId,

    /// A duration is zero or inconsistent with another one.
    #[error("invalid duration for {name}: {reason}")]
    InvalidDuration { name: &'static str, reason: String },

    /// A threshold is zero.
    #[error("threshold {name} must be at least 1")]
    InvalidThreshold { name: &'static str },

    /// The discovery backend URL is malformed.
    #[error("invalid discovery url '{url}': {reason}")]
    InvalidDiscoveryUrl { url: String, reason: String },

    /// Only one of the CA certificate and key paths is set.
    #[error("ca_cert_path and ca_key_path must be set together")]
    IncompleteCaPaths,
}

/// Registry timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Heartbeat age after which an instance is excluded from selection.
    pub heartbeat_ttl: Duration,
    /// Heartbeat age after which the sweep removes the instance.
    pub deregister_critical_service_after: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(10),
            deregister_critical_service_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Active health checking and hysteresis thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive successes before an instance is considered healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before an instance is considered unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// Certificates, rotation and token validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Lifetime of issued certificates, in days.
    pub validity_days: u32,
    pub cert_rotation: Duration,
    /// How long superseded credentials keep verifying after a rotation.
    pub grace_period: Duration,
    pub token_cache_ttl: Duration,
    /// Shared HS256 secret; token validation is disabled when unset.
    #[serde(default, skip_serializing)]
    pub jwt_secret: Option<String>,
    /// Whether outbound calls and the proxy listener use mutual TLS.
    pub tls_enabled: bool,
    /// Whether the proxy rejects unsigned inbound requests.
    pub verify_inbound: bool,
    /// Largest accepted distance between a signature timestamp and now.
    pub max_clock_skew: Duration,
    /// PEM certificate of an existing mesh root; a fresh root is generated
    /// when unset.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default)]
    pub ca_key_path: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            validity_days: 2,
            cert_rotation: Duration::from_secs(24 * 60 * 60),
            grace_period: Duration::from_secs(60 * 60),
            token_cache_ttl: Duration::from_secs(60),
            jwt_secret: None,
            tls_enabled: false,
            verify_inbound: false,
            max_clock_skew: Duration::from_secs(5 * 60),
            ca_cert_path: None,
            ca_key_path: None,
        }
    }
}

impl SecurityConfig {
    /// Returns the certificate lifetime.
    pub fn validity(&self) -> Duration {
        Duration::from_secs(u64::from(self.validity_days) * 24 * 60 * 60)
    }
}

/// Mesh node configuration loaded at startup.
///
/// Immutable after initialization and shared across tasks via `Arc`.
///
/// # Environment Variables
///
/// * `MESH_SERVICE_ID` - Identity of the local service (default: "mesh-proxy")
/// * `MESH_PROXY_ADDR` - Data-plane proxy address (default: "127.0.0.1:15001")
/// * `MESH_CONTROL_ADDR` - Registration and policy API (default: "127.0.0.1:15010")
/// * `MESH_ADMIN_ADDR` - `/health` and `/metrics` (default: "127.0.0.1:15000")
/// * `MESH_HEARTBEAT_TTL_MS`, `MESH_DEREGISTER_AFTER_MS`, `MESH_SWEEP_INTERVAL_MS`
/// * `MESH_HEALTH_INTERVAL_MS`, `MESH_HEALTH_TIMEOUT_MS`,
///   `MESH_HEALTHY_THRESHOLD`, `MESH_UNHEALTHY_THRESHOLD`
/// * `MESH_CERT_VALIDITY_DAYS`, `MESH_CERT_ROTATION_SECS`, `MESH_CERT_GRACE_SECS`
/// * `MESH_TOKEN_CACHE_TTL_MS`, `MESH_JWT_SECRET`
/// * `MESH_TLS_ENABLED`, `MESH_VERIFY_INBOUND`, `MESH_SIGNATURE_SKEW_MS`
/// * `MESH_CA_CERT_PATH`, `MESH_CA_KEY_PATH` - Mesh root to load instead of generating one
/// * `MESH_POLICY_REFRESH_MS`
/// * `MESH_DISCOVERY_URL`, `MESH_DISCOVERY_SERVICES` (comma-separated)
///
/// # Example
///
/// ```
/// use servicemesh_core::config::MeshConfig;
///
/// let config = MeshConfig::from_env();
/// assert!(!config.service_id.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub service_id: String,
    pub proxy_addr: String,
    pub control_addr: String,
    pub admin_addr: String,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// How often proxies poll the control plane for policy changes.
    pub policy_refresh: Duration,
    /// Base URL of a Consul-compatible discovery backend.
    #[serde(default)]
    pub discovery_url: Option<String>,
    /// Services pulled from the discovery backend.
    #[serde(default)]
    pub discovery_services: Vec<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            service_id: "mesh-proxy".to_string(),
            proxy_addr: "127.0.0.1:15001".to_string(),
            control_addr: "127.0.0.1:15010".to_string(),
            admin_addr: "127.0.0.1:15000".to_string(),
            registry: RegistryConfig::default(),
            health: HealthConfig::default(),
            security: SecurityConfig::default(),
            policy_refresh: Duration::from_secs(5),
            discovery_url: None,
            discovery_services: Vec::new(),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl MeshConfig {
    /// Loads configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let registry = RegistryConfig {
            heartbeat_ttl: env_millis("MESH_HEARTBEAT_TTL_MS", defaults.registry.heartbeat_ttl),
            deregister_critical_service_after: env_millis(
                "MESH_DEREGISTER_AFTER_MS",
                defaults.registry.deregister_critical_service_after,
            ),
            sweep_interval: env_millis("MESH_SWEEP_INTERVAL_MS", defaults.registry.sweep_interval),
        };

        let health = HealthConfig {
            interval: env_millis("MESH_HEALTH_INTERVAL_MS", defaults.health.interval),
            timeout: env_millis("MESH_HEALTH_TIMEOUT_MS", defaults.health.timeout),
            healthy_threshold: env_parse("MESH_HEALTHY_THRESHOLD")
                .unwrap_or(defaults.health.healthy_threshold),
            unhealthy_threshold: env_parse("MESH_UNHEALTHY_THRESHOLD")
                .unwrap_or(defaults.health.unhealthy_threshold),
        };

        let security = SecurityConfig {
            validity_days: env_parse("MESH_CERT_VALIDITY_DAYS")
                .unwrap_or(defaults.security.validity_days),
            cert_rotation: env_parse::<u64>("MESH_CERT_ROTATION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.security.cert_rotation),
            grace_period: env_parse::<u64>("MESH_CERT_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.security.grace_period),
            token_cache_ttl: env_millis(
                "MESH_TOKEN_CACHE_TTL_MS",
                defaults.security.token_cache_ttl,
            ),
            jwt_secret: env::var("MESH_JWT_SECRET").ok().filter(|s| !s.is_empty()),
            tls_enabled: env_bool("MESH_TLS_ENABLED", defaults.security.tls_enabled),
            verify_inbound: env_bool("MESH_VERIFY_INBOUND", defaults.security.verify_inbound),
            max_clock_skew: env_millis("MESH_SIGNATURE_SKEW_MS", defaults.security.max_clock_skew),
            ca_cert_path: env::var("MESH_CA_CERT_PATH").ok().filter(|s| !s.is_empty()),
            ca_key_path: env::var("MESH_CA_KEY_PATH").ok().filter(|s| !s.is_empty()),
        };

        let discovery_services = env::var("MESH_DISCOVERY_SERVICES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            service_id: env_string("MESH_SERVICE_ID", &defaults.service_id),
            proxy_addr: env_string("MESH_PROXY_ADDR", &defaults.proxy_addr),
            control_addr: env_string("MESH_CONTROL_ADDR", &defaults.control_addr),
            admin_addr: env_string("MESH_ADMIN_ADDR", &defaults.admin_addr),
            registry,
            health,
            security,
            policy_refresh: env_millis("MESH_POLICY_REFRESH_MS", defaults.policy_refresh),
            discovery_url: env::var("MESH_DISCOVERY_URL").ok().filter(|s| !s.is_empty()),
            discovery_services,
        }
    }

    /// Loads configuration from environment variables and validates it.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The service id is empty
    /// - A listener address is not a valid socket address, or two are equal
    /// - A threshold is zero
    /// - An interval is zero, or the expiry threshold is below the staleness one
    /// - Only one of the CA certificate and key paths is set
    /// - The discovery URL is not a valid http(s) URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_id.trim().is_empty() {
            return Err(ConfigError::EmptyServiceId);
        }

        let addrs = [
            ("proxy", &self.proxy_addr),
            ("control", &self.control_addr),
            ("admin", &self.admin_addr),
        ];
        for (name, addr) in addrs {
            addr.parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidAddr {
                    name,
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
        }
        for (i, (_, a)) in addrs.iter().enumerate() {
            if addrs[i + 1..].iter().any(|(_, b)| a == b) {
                return Err(ConfigError::DuplicateAddrs {
                    addr: (*a).clone(),
                });
            }
        }

        if self.health.healthy_threshold == 0 {
            return Err(ConfigError::InvalidThreshold {
                name: "healthy_threshold",
            });
        }
        if self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::InvalidThreshold {
                name: "unhealthy_threshold",
            });
        }

        let intervals = [
            ("heartbeat_ttl", self.registry.heartbeat_ttl),
            ("sweep_interval", self.registry.sweep_interval),
            ("health.interval", self.health.interval),
            ("health.timeout", self.health.timeout),
            ("cert_rotation", self.security.cert_rotation),
            ("max_clock_skew", self.security.max_clock_skew),
            ("token_cache_ttl", self.security.token_cache_ttl),
            ("policy_refresh", self.policy_refresh),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::InvalidDuration {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.registry.deregister_critical_service_after < self.registry.heartbeat_ttl {
            return Err(ConfigError::InvalidDuration {
                name: "deregister_critical_service_after",
                reason: "must not be shorter than heartbeat_ttl".to_string(),
            });
        }

        if self.health.timeout > self.health.interval {
            return Err(ConfigError::InvalidDuration {
                name: "health.timeout",
                reason: "must not exceed health.interval".to_string(),
            });
        }

        if self.security.validity_days == 0 {
            return Err(ConfigError::InvalidDuration {
                name: "validity_days",
                reason: "must be at least one day".to_string(),
            });
        }

        if self.security.cert_rotation >= self.security.validity() {
            return Err(ConfigError::InvalidDuration {
                name: "cert_rotation",
                reason: "must be shorter than certificate validity".to_string(),
            });
        }

        if self.security.ca_cert_path.is_some() != self.security.ca_key_path.is_some() {
            return Err(ConfigError::IncompleteCaPaths);
        }

        if let Some(url) = &self.discovery_url {
            let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidDiscoveryUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ConfigError::InvalidDiscoveryUrl {
                    url: url.clone(),
                    reason: "must start with http:// or https://".to_string(),
                });
            }
        }

        Ok(())
    }
}
