//! Service mesh core: the data and control plane of a mesh node.
//!
//! A node keeps a registry of service instances with heartbeat-based expiry
//! and hysteresis-gated health, selects endpoints with pluggable load
//! balancing, guards every (caller, target) pair with a circuit breaker and
//! retries failed calls with jittered exponential backoff. Identities are
//! issued by a local certificate authority and used both for mutual TLS and
//! for request signing. Traffic policies are versioned by the control plane
//! and pushed to the proxies that cache them.
//!
//! The `meshd` binary wires these pieces into a sidecar with a proxy
//! listener, a control API and an admin listener.

pub mod api;
pub mod balancer;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod control_plane;
pub mod discovery;
pub mod error;
pub mod health;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod retry;
pub mod security;
pub mod server;
pub mod tls;
pub mod token;
pub mod transport;
