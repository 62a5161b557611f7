//! The mesh client: the state machine behind every outbound call.
//!
//! One call walks `RESOLVE → CIRCUIT_CHECK → SELECT_ENDPOINT → SECURE →
//! TRANSPORT` and ends in success, a retry from `CIRCUIT_CHECK`, or a
//! terminal [`CallError`]. Circuit and connection state are updated on every
//! path, including failures and caller cancellation.

use crate::balancer::{EndpointLease, LoadBalancer};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::control_plane::PolicyCache;
use crate::error::{CallError, FailureKind, MeshError, SecurityError, TokenError};
use crate::health::HealthTracker;
use crate::metrics::Metrics;
use crate::policy::MeshPolicy;
use crate::proxy::HEADER_SERVICE;
use crate::registry::{InstanceKey, ServiceInstance, ServiceRegistry};
use crate::security::{RequestScope, SecurityLayer};
use crate::transport::{MeshRequest, MeshResponse, SecurityContext, Transport};
use http::header::{HeaderValue, AUTHORIZATION};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of a single transport attempt.
enum Attempt {
    Done(MeshResponse),
    Failed(MeshError),
    Cancelled,
}

/// Client through which application code calls other services.
///
/// Retries follow the target's [`RetryPolicy`](crate::retry::RetryPolicy).
/// Whether an operation is safe to retry is the caller's responsibility:
/// use a policy with `max_attempts = 1` for non-idempotent requests.
pub struct MeshClient {
    caller: String,
    registry: Arc<ServiceRegistry>,
    balancer: Arc<LoadBalancer>,
    breaker: Arc<CircuitBreaker>,
    policies: Arc<PolicyCache>,
    transport: Arc<dyn Transport>,
    security: Option<Arc<SecurityLayer>>,
    bearer_token: Option<String>,
}

impl MeshClient {
    pub fn new(
        caller: impl Into<String>,
        registry: Arc<ServiceRegistry>,
        balancer: Arc<LoadBalancer>,
        policies: Arc<PolicyCache>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let caller = caller.into();
        Self {
            breaker: Arc::new(CircuitBreaker::new(
                caller.clone(),
                CircuitBreakerConfig::default(),
            )),
            caller,
            registry,
            balancer,
            policies,
            transport,
            security: None,
            bearer_token: None,
        }
    }

    /// Signs every request and, when TLS is enabled, uses mutual TLS.
    pub fn with_security(mut self, security: Arc<SecurityLayer>) -> Self {
        self.security = Some(security);
        self
    }

    /// Sends `authorization: Bearer <token>` with every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// Circuit breakers of this caller, one per target.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    fn health(&self) -> &Arc<HealthTracker> {
        self.registry.health()
    }

    /// Calls `service_id`.
    pub async fn call(
        &self,
        service_id: &str,
        request: MeshRequest,
    ) -> Result<MeshResponse, CallError> {
        self.call_with_cancel(service_id, request, None, &CancellationToken::new())
            .await
    }

    /// Calls `service_id`, routing on `routing_key` under consistent hashing.
    pub async fn call_with_key(
        &self,
        service_id: &str,
        request: MeshRequest,
        routing_key: &str,
    ) -> Result<MeshResponse, CallError> {
        self.call_with_cancel(service_id, request, Some(routing_key), &CancellationToken::new())
            .await
    }

    /// Calls `service_id` until success, a terminal failure, or `cancel`
    /// fires.
    ///
    /// Cancellation abandons the in-flight attempt, releases its endpoint and
    /// does not count as a failure of the target.
    pub async fn call_with_cancel(
        &self,
        service_id: &str,
        request: MeshRequest,
        routing_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MeshResponse, CallError> {
        let started = Instant::now();
        let result = self
            .execute(service_id, request, routing_key, cancel)
            .await;

        // Unresolvable names stay out of the per-target series.
        let unresolved = matches!(
            &result,
            Err(e) if e.never_attempted() && matches!(e.cause, MeshError::ServiceUnavailable { .. })
        );
        if unresolved {
            return result;
        }

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.cause.outcome_label(),
        };
        Metrics::record_call(
            &self.caller,
            service_id,
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn execute(
        &self,
        service_id: &str,
        request: MeshRequest,
        routing_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MeshResponse, CallError> {
        // RESOLVE before touching any per-target state, so unknown names
        // leave no policy, breaker or pool behind.
        let instances = self.registry.list_instances(service_id);
        if instances.is_empty() {
            return Err(CallError::new(
                0,
                MeshError::ServiceUnavailable {
                    service_id: service_id.to_string(),
                },
            ));
        }

        let policy = self.policies.get(service_id).await;
        self.breaker
            .configure(service_id, policy.circuit_breaker_policy.clone());
        self.balancer
            .apply_traffic_policy(service_id, &policy.traffic_policy);

        // Connect failures reach passive health once the call is over, so a
        // single call never shrinks its own candidate set.
        let mut unreachable = Vec::new();
        let result = self
            .attempt_loop(
                service_id,
                &request,
                routing_key,
                cancel,
                &policy,
                instances,
                &mut unreachable,
            )
            .await;
        for key in &unreachable {
            self.health().record_failure(key);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        service_id: &str,
        request: &MeshRequest,
        routing_key: Option<&str>,
        cancel: &CancellationToken,
        policy: &MeshPolicy,
        resolved: Vec<ServiceInstance>,
        unreachable: &mut Vec<InstanceKey>,
    ) -> Result<MeshResponse, CallError> {
        let mut backoff = policy.retry_policy.backoff();
        let mut resolved = Some(resolved);
        let mut last_error: Option<MeshError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CallError::new(backoff.attempts(), MeshError::Cancelled));
            }

            // RESOLVE
            let instances = resolved
                .take()
                .unwrap_or_else(|| self.registry.list_instances(service_id));
            if instances.is_empty() {
                let cause = last_error.take().unwrap_or_else(|| MeshError::ServiceUnavailable {
                    service_id: service_id.to_string(),
                });
                return Err(CallError::new(backoff.attempts(), cause));
            }

            // CIRCUIT_CHECK
            if !self.breaker.is_allowed(service_id) {
                debug!(caller = %self.caller, target = %service_id, "circuit open, failing fast");
                return Err(CallError::new(
                    backoff.attempts(),
                    MeshError::CircuitOpen {
                        target: service_id.to_string(),
                    },
                ));
            }

            // SELECT_ENDPOINT
            let lease = match self.balancer.lease(service_id, &instances, routing_key) {
                Ok(lease) => lease,
                Err(e) => {
                    self.breaker.abandon(service_id);
                    let cause = last_error.take().unwrap_or_else(|| e.into());
                    return Err(CallError::new(backoff.attempts(), cause));
                }
            };

            // SECURE
            let mut attempt_request = request.clone();
            let security = match self.secure(service_id, &mut attempt_request).await {
                Ok(security) => security,
                Err(e) => {
                    self.breaker.abandon(service_id);
                    warn!(caller = %self.caller, target = %service_id, error = %e, "failed to secure call");
                    return Err(CallError::new(backoff.attempts(), e));
                }
            };

            // TRANSPORT
            backoff.record_attempt();
            let outcome = self
                .transport_attempt(&lease, attempt_request, &security, policy.timeout(), cancel)
                .await;
            let key = {
                let endpoint = lease.endpoint();
                InstanceKey::new(&endpoint.service_id, &endpoint.instance_id)
            };
            lease.release();

            let error = match outcome {
                Attempt::Done(mut response) => {
                    response.attempts = backoff.attempts();
                    self.breaker.record_success(service_id);
                    self.health().record_success(&key);
                    return Ok(response);
                }
                Attempt::Cancelled => {
                    self.breaker.abandon(service_id);
                    debug!(caller = %self.caller, target = %service_id, "call cancelled by caller");
                    return Err(CallError::new(backoff.attempts(), MeshError::Cancelled));
                }
                Attempt::Failed(error) => error,
            };

            self.breaker.record_failure(service_id);
            let kind = error.failure_kind();
            if kind == Some(FailureKind::ConnectFailure) {
                unreachable.push(key);
            }

            let Some(delay) = kind.and_then(|k| backoff.next_delay(k)) else {
                warn!(
                    caller = %self.caller,
                    target = %service_id,
                    attempts = backoff.attempts(),
                    error = %error,
                    "call failed"
                );
                return Err(CallError::new(backoff.attempts(), error));
            };

            warn!(
                caller = %self.caller,
                target = %service_id,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            Metrics::record_retry(&self.caller, service_id);
            last_error = Some(error);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CallError::new(backoff.attempts(), MeshError::Cancelled));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Attaches the caller's identity to the request.
    ///
    /// Signed requests also name their target in `x-mesh-service`, so a
    /// verifying proxy checks the signature against the service it forwards to.
    async fn secure(
        &self,
        service_id: &str,
        request: &mut MeshRequest,
    ) -> Result<SecurityContext, MeshError> {
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                MeshError::Security(SecurityError::Token(TokenError::Invalid(
                    "token is not a valid header".to_string(),
                )))
            })?;
            request.headers.insert(AUTHORIZATION, value);
        }

        let Some(security) = &self.security else {
            return Ok(SecurityContext::plaintext(service_id));
        };

        let credentials = security.establish_mtls(&self.caller).await?;
        let target = HeaderValue::from_str(service_id).map_err(|_| {
            MeshError::Security(SecurityError::InvalidSignature(
                "target is not a valid header".to_string(),
            ))
        })?;
        request.headers.insert(HEADER_SERVICE, target);
        let scope = RequestScope::new(&request.method, &request.path, service_id);
        security
            .sign_request(scope, request.body.clone(), &credentials)?
            .write_headers(&mut request.headers)?;

        if security.config().tls_enabled {
            Ok(SecurityContext::mutual_tls(service_id, credentials))
        } else {
            Ok(SecurityContext::plaintext(service_id))
        }
    }

    /// Runs one transport attempt bounded by `timeout`.
    async fn transport_attempt(
        &self,
        lease: &EndpointLease,
        request: MeshRequest,
        security: &SecurityContext,
        timeout: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Attempt {
        let endpoint = lease.endpoint();
        let send = tokio::time::timeout(timeout, self.transport.send(endpoint, request, security));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            result = send => result,
        };

        match result {
            Err(_) => Attempt::Failed(MeshError::timeout(timeout)),
            Ok(Err(e)) => Attempt::Failed(e.into()),
            Ok(Ok(response)) if response.status.is_server_error() => {
                Attempt::Failed(MeshError::ServerError {
                    addr: endpoint.address(),
                    status: response.status.as_u16(),
                })
            }
            Ok(Ok(response)) => Attempt::Done(response),
        }
    }
}
