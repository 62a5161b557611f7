//! Bearer token validation.
//!
//! The token issuer is an external collaborator; the mesh only needs
//! something implementing [`TokenValidator`]. [`JwtValidator`] checks HS256
//! tokens against a shared secret and [`CachingValidator`] bounds latency by
//! caching verified claims.

use crate::error::TokenError;
use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Verified token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Remaining claims, e.g. `aud` or scopes.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// Time until `exp`, zero if already expired.
    pub fn remaining_lifetime(&self) -> Duration {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Duration::from_secs(self.exp.saturating_sub(now))
    }
}

/// Validates bearer tokens.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Claims, TokenError>;
}

/// HS256 JWT validation with a shared secret.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Requires the `iss` claim to equal `issuer`.
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Requires the `aud` claim to contain `audience`.
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    /// Sets the clock skew tolerated on `exp`.
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.validation.leeway = leeway.as_secs();
        self
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })
    }
}

struct CachedClaims {
    claims: Claims,
    valid_until: Instant,
}

/// Caches verified claims for `min(ttl, exp - now)`.
///
/// Failures are never cached. The cache holds at most `max_entries` tokens:
/// a full cache drops its expired entries before admitting a new one, and
/// skips caching while every entry is still live.
pub struct CachingValidator {
    inner: Arc<dyn TokenValidator>,
    ttl: Duration,
    max_entries: usize,
    cache: DashMap<String, CachedClaims>,
}

impl CachingValidator {
    pub fn new(inner: Arc<dyn TokenValidator>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            cache: DashMap::new(),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Number of cached tokens, including expired entries not yet evicted.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drops expired entries.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.cache.retain(|_, entry| entry.valid_until > now);
    }

    fn has_room(&self, token: &str) -> bool {
        if self.cache.len() < self.max_entries || self.cache.contains_key(token) {
            return true;
        }
        self.evict_expired();
        self.cache.len() < self.max_entries
    }

    /// Evicts expired entries every `period` until shutdown.
    pub async fn run_eviction(
        self: Arc<Self>,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let before = self.cache.len();
                    self.evict_expired();
                    let evicted = before.saturating_sub(self.cache.len());
                    if evicted > 0 {
                        debug!(evicted, remaining = self.cache.len(), "evicted expired tokens");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping token cache eviction");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl TokenValidator for CachingValidator {
    async fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let now = Instant::now();
        if let Some(entry) = self.cache.get(token) {
            if entry.valid_until > now {
                return Ok(entry.claims.clone());
            }
        }

        let claims = self.inner.validate(token).await?;
        let lifetime = self.ttl.min(claims.remaining_lifetime());
        if lifetime.is_zero() {
            self.cache.remove(token);
        } else if self.has_room(token) {
            self.cache.insert(
                token.to_string(),
                CachedClaims {
                    claims: claims.clone(),
                    valid_until: now + lifetime,
                },
            );
        }
        debug!(sub = %claims.sub, cached_for_ms = lifetime.as_millis() as u64, "token validated");
        Ok(claims)
    }
}
