//! Error types for the service mesh core.
//!
//! Each component owns a small error enum; [`MeshError`] is the taxonomy a
//! single outbound call can end in, and [`CallError`] is what the application
//! finally sees.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors returned synchronously by the service registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The instance is already registered and its heartbeat is still fresh.
    #[error("instance {instance_id} of service {service_id} is already registered")]
    DuplicateInstance {
        service_id: String,
        instance_id: String,
    },

    /// No such instance is registered.
    #[error("instance {instance_id} of service {service_id} not found")]
    NotFound {
        service_id: String,
        instance_id: String,
    },
}

/// Errors returned by the load balancer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalancerError {
    /// Every registered endpoint of the service is unhealthy or excluded.
    #[error("no healthy endpoint for service {service_id}")]
    NoHealthyEndpoint { service_id: String },
}

/// Token validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The token is malformed, badly signed or fails claim validation.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// The token has expired.
    #[error("token expired")]
    Expired,

    /// No validator is configured; tokens are rejected.
    #[error("token validation is not configured")]
    NotConfigured,

    /// The external issuer could not be reached.
    #[error("token issuer unavailable: {0}")]
    IssuerUnavailable(String),
}

/// Failures of the security layer. All of them fail closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// The certificate authority could not issue credentials.
    #[error("certificate issuance failed for {service_id}: {reason}")]
    CertificateIssuance { service_id: String, reason: String },

    /// The request signature does not match or the signing key is unknown.
    #[error("invalid request signature: {0}")]
    InvalidSignature(String),

    /// The credentials used to sign the request are no longer valid.
    #[error("credential {key_id} has expired")]
    ExpiredCredential { key_id: String },

    /// Bearer token rejected.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// TLS material could not be turned into a rustls configuration.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Control plane policy errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The policy failed validation.
    #[error("invalid policy: {0}")]
    Invalid(String),

    /// The remote control plane could not be queried.
    #[error("policy source unavailable: {0}")]
    Unavailable(String),
}

/// Errors talking to the external discovery backend.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Request to the backend failed.
    #[error("discovery request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    /// Backend answered with a non-success status.
    #[error("discovery backend returned status {status} for {url}")]
    Status { url: String, status: u16 },

    /// Backend payload could not be decoded.
    #[error("failed to decode discovery response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Base URL could not be joined with the API path.
    #[error("invalid discovery url: {0}")]
    Url(#[from] url::ParseError),
}

/// Failures produced by a transport while executing one attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// TCP connect or TLS handshake failed.
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// The peer refused the request before processing it.
    #[error("request refused by {addr}")]
    RefusedStream { addr: String },

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// Classification of a failed attempt, used to match retry conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ServerError,
    ConnectFailure,
    RefusedStream,
    Timeout,
    Other,
}

/// Everything a single mesh call can end in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// No instances are registered for the service.
    #[error("service {service_id} unavailable: no registered instances")]
    ServiceUnavailable { service_id: String },

    /// Instances exist but none is healthy.
    #[error(transparent)]
    NoHealthyEndpoint(#[from] BalancerError),

    /// Circuit breaker rejected the call without a transport attempt.
    #[error("circuit breaker is open for {target}")]
    CircuitOpen { target: String },

    /// Security layer refused to secure or accept the call.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Attempt exceeded the policy timeout.
    #[error("request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Upstream answered with a 5xx status.
    #[error("upstream {addr} returned status {status}")]
    ServerError { addr: String, status: u16 },

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The caller abandoned the call.
    #[error("call cancelled by caller")]
    Cancelled,
}

impl MeshError {
    /// Creates a timeout error from the elapsed budget.
    pub fn timeout(duration: Duration) -> Self {
        MeshError::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Returns the retry classification for transient failures.
    ///
    /// Structural, circuit, security and cancellation errors have no kind
    /// and are never retried.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            MeshError::Timeout { .. } => Some(FailureKind::Timeout),
            MeshError::ServerError { .. } => Some(FailureKind::ServerError),
            MeshError::Transport(TransportError::Connect { .. }) => {
                Some(FailureKind::ConnectFailure)
            }
            MeshError::Transport(TransportError::RefusedStream { .. }) => {
                Some(FailureKind::RefusedStream)
            }
            MeshError::Transport(TransportError::Other(_)) => Some(FailureKind::Other),
            _ => None,
        }
    }

    /// Returns true for transient failures (timeout, 5xx, transport).
    pub fn is_retryable(&self) -> bool {
        self.failure_kind().is_some()
    }

    /// Returns the label used for the `outcome` metric.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            MeshError::ServiceUnavailable { .. } => "service_unavailable",
            MeshError::NoHealthyEndpoint(_) => "no_healthy_endpoint",
            MeshError::CircuitOpen { .. } => "circuit_open",
            MeshError::Security(_) => "security",
            MeshError::Timeout { .. } => "timeout",
            MeshError::ServerError { .. } => "server_error",
            MeshError::Transport(_) => "transport",
            MeshError::Cancelled => "cancelled",
        }
    }
}

/// Terminal failure of a mesh call: the last cause plus how many transport
/// attempts were made. Zero attempts means the call was never tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub attempts: u32,
    pub cause: MeshError,
}

impl CallError {
    pub fn new(attempts: u32, cause: MeshError) -> Self {
        Self { attempts, cause }
    }

    /// Returns true if no transport attempt was made.
    pub fn never_attempted(&self) -> bool {
        self.attempts == 0
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.cause, self.attempts)
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Errors that can occur while running listeners and the binary.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS handshake error.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Security layer failure during startup.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for listener and server operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
