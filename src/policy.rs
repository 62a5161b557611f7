//! Mesh policy: the configuration bundle distributed by the control plane.

use crate::balancer::Strategy;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::PolicyError;
use crate::registry::ServiceInstance;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Routing weights for canary and blue-green rollouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficPolicy {
    /// Overrides the balancer's strategy for the service when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<Strategy>,
    /// Weight per instance `version` label. A weight of 0 drains a version.
    pub version_weights: BTreeMap<String, u32>,
}

impl TrafficPolicy {
    /// Weight of an instance: its version's weight when one is configured,
    /// else its `weight` metadata label, else 1.
    pub fn effective_weight(version_weights: &BTreeMap<String, u32>, instance: &ServiceInstance) -> u32 {
        instance
            .metadata
            .get("version")
            .and_then(|v| version_weights.get(v))
            .copied()
            .or_else(|| {
                instance
                    .metadata
                    .get("weight")
                    .and_then(|w| w.trim().parse().ok())
            })
            .unwrap_or(1)
    }

    pub fn weight_of(&self, instance: &ServiceInstance) -> u32 {
        Self::effective_weight(&self.version_weights, instance)
    }
}

/// Per-service policy: timeouts, retries, circuit thresholds and routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshPolicy {
    /// Bound of each transport attempt.
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub circuit_breaker_policy: CircuitBreakerConfig,
    pub traffic_policy: TrafficPolicy,
}

impl Default for MeshPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retry_policy: RetryPolicy::default(),
            circuit_breaker_policy: CircuitBreakerConfig::default(),
            traffic_policy: TrafficPolicy::default(),
        }
    }
}

impl MeshPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validates the policy before it is versioned.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError::Invalid` if:
    /// - `timeout_ms` is zero
    /// - the retry policy is inconsistent
    /// - a circuit threshold is zero
    /// - every version weight is zero
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.timeout_ms == 0 {
            return Err(PolicyError::Invalid("timeout_ms must be positive".to_string()));
        }
        self.retry_policy.validate()?;

        let cb = &self.circuit_breaker_policy;
        if cb.failure_threshold == 0 {
            return Err(PolicyError::Invalid(
                "circuit_breaker_policy.failure_threshold must be at least 1".to_string(),
            ));
        }
        if cb.half_open_calls == 0 {
            return Err(PolicyError::Invalid(
                "circuit_breaker_policy.half_open_calls must be at least 1".to_string(),
            ));
        }

        let weights = &self.traffic_policy.version_weights;
        if !weights.is_empty() && weights.values().all(|w| *w == 0) {
            return Err(PolicyError::Invalid(
                "traffic_policy.version_weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }
}
