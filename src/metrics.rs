//! Prometheus metrics collection and export.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels identifying a (caller, target) pair.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub caller: String,
    pub target: String,
}

/// Labels for completed calls.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub caller: String,
    pub target: String,
    /// `success` or a failure class such as `timeout`.
    pub outcome: String,
}

/// Labels for a single service instance.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub service: String,
    pub instance: String,
}

/// Global metrics registry.
///
/// Initialized once at startup and shared across all tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the mesh.
///
/// Tracks call outcomes and latency, retries, circuit state and endpoint health.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<OutcomeLabels, Counter>,
    request_duration_seconds: Family<RouteLabels, Histogram>,
    retries_total: Family<RouteLabels, Counter>,
    circuit_state: Family<RouteLabels, Gauge>,
    endpoint_health: Family<InstanceLabels, Gauge>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "mesh_requests",
            "Total number of mesh calls by outcome",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RouteLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 12))
            });
        registry.register(
            "mesh_request_duration_seconds",
            "Mesh call latency in seconds, including retries",
            request_duration_seconds.clone(),
        );

        let retries_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "mesh_retries",
            "Number of retried transport attempts",
            retries_total.clone(),
        );

        let circuit_state = Family::<RouteLabels, Gauge>::default();
        registry.register(
            "mesh_circuit_state",
            "Circuit breaker state (0 closed, 1 open, 2 half-open)",
            circuit_state.clone(),
        );

        let endpoint_health = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "mesh_endpoint_health",
            "Instance health (1 healthy, 0 unhealthy, -1 unknown)",
            endpoint_health.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            retries_total,
            circuit_state,
            endpoint_health,
        }
    }

    /// Records a finished call with its outcome and total duration.
    pub fn record_call(caller: &str, target: &str, outcome: &str, duration_secs: f64) {
        let outcome_labels = OutcomeLabels {
            caller: caller.to_string(),
            target: target.to_string(),
            outcome: outcome.to_string(),
        };
        let route = RouteLabels {
            caller: caller.to_string(),
            target: target.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&outcome_labels).inc();
            metrics
                .request_duration_seconds
                .get_or_create(&route)
                .observe(duration_secs);
        }
    }

    /// Counts a retried attempt.
    pub fn record_retry(caller: &str, target: &str) {
        let route = RouteLabels {
            caller: caller.to_string(),
            target: target.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.retries_total.get_or_create(&route).inc();
        }
    }

    /// Publishes the circuit state code for a (caller, target) pair.
    pub fn set_circuit_state(caller: &str, target: &str, code: i64) {
        let route = RouteLabels {
            caller: caller.to_string(),
            target: target.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.circuit_state.get_or_create(&route).set(code);
        }
    }

    /// Publishes the health code of an instance.
    pub fn set_endpoint_health(service: &str, instance: &str, code: i64) {
        let labels = InstanceLabels {
            service: service.to_string(),
            instance: instance.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.endpoint_health.get_or_create(&labels).set(code);
        }
    }

    /// Drops the health series of a deregistered instance.
    pub fn remove_endpoint_health(service: &str, instance: &str) {
        let labels = InstanceLabels {
            service: service.to_string(),
            instance: instance.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.endpoint_health.remove(&labels);
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}
