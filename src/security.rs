//! Security layer: workload certificates, request signing and token checks.
//!
//! Every failure here fails closed: an unverifiable request is rejected,
//! never passed through.
//!
//! A signature covers the caller identity, a timestamp, the method, the path,
//! the target service and the body. Timestamps outside the configured clock
//! skew are rejected, which bounds how long a captured request can be replayed.
//!
//! Credentials are short-lived. Rotation issues new credentials while the
//! superseded ones keep verifying until the grace window ends, so calls
//! signed just before a rotation still succeed.

use crate::config::SecurityConfig;
use crate::error::{SecurityError, TokenError};
use crate::token::{Claims, TokenValidator};
use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue, Method};
use hyper::body::Bytes;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_CALLER: &str = "x-mesh-caller";
pub const HEADER_KEY_ID: &str = "x-mesh-key-id";
pub const HEADER_TIMESTAMP: &str = "x-mesh-timestamp";
pub const HEADER_SIGNATURE: &str = "x-mesh-signature";

/// A certificate issued by a [`CertificateAuthority`].
#[derive(Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    /// Root the certificate chains to.
    pub ca_pem: String,
    pub validity: Duration,
}

/// Issues workload certificates bound to a service identity.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn issue(&self, service_id: &str, validity: Duration)
        -> Result<IssuedCertificate, SecurityError>;

    /// PEM of the root all issued certificates chain to.
    fn root_pem(&self) -> String;
}

/// In-process mesh root issuing ECDSA P-256 leaf certificates.
pub struct LocalCertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// Root as distributed to peers.
    ca_pem: String,
}

impl LocalCertificateAuthority {
    /// Generates a fresh self-signed mesh root.
    pub fn generate(name: &str) -> Result<Self, SecurityError> {
        let issuance_error = |reason: String| SecurityError::CertificateIssuance {
            service_id: name.to_string(),
            reason,
        };

        let ca_key = KeyPair::generate().map_err(|e| issuance_error(e.to_string()))?;
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| issuance_error(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + time::Duration::days(365);

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| issuance_error(e.to_string()))?;

        info!(root = %name, "generated mesh root certificate");
        let ca_pem = ca_cert.pem();
        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem,
        })
    }

    /// Restores a mesh root from its PEM certificate and private key.
    ///
    /// Leaf certificates chain to `cert_pem` as given, so nodes sharing the
    /// root keep trusting each other across restarts.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, SecurityError> {
        let issuance_error = |reason: String| SecurityError::CertificateIssuance {
            service_id: "mesh root".to_string(),
            reason,
        };

        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| issuance_error(format!("invalid root key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| issuance_error(format!("invalid root certificate: {}", e)))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| issuance_error(e.to_string()))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem: cert_pem.to_string(),
        })
    }

    /// Reads a mesh root from PEM files.
    pub fn load(cert_path: &str, key_path: &str) -> Result<Self, SecurityError> {
        let read = |path: &str| {
            std::fs::read_to_string(path).map_err(|e| SecurityError::CertificateIssuance {
                service_id: "mesh root".to_string(),
                reason: format!("failed to read {}: {}", path, e),
            })
        };
        let authority = Self::from_pem(&read(cert_path)?, &read(key_path)?)?;
        info!(cert = %cert_path, "loaded mesh root certificate");
        Ok(authority)
    }

    /// PEM of the root's private key, for persisting a generated root.
    pub fn key_pem(&self) -> String {
        self.ca_key.serialize_pem()
    }
}

#[async_trait]
impl CertificateAuthority for LocalCertificateAuthority {
    async fn issue(
        &self,
        service_id: &str,
        validity: Duration,
    ) -> Result<IssuedCertificate, SecurityError> {
        let issuance_error = |reason: String| SecurityError::CertificateIssuance {
            service_id: service_id.to_string(),
            reason,
        };

        let key = KeyPair::generate().map_err(|e| issuance_error(e.to_string()))?;
        let mut params = CertificateParams::new(vec![service_id.to_string()])
            .map_err(|e| issuance_error(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, service_id);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let lifetime = time::Duration::try_from(validity)
            .map_err(|e| issuance_error(e.to_string()))?;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(1);
        params.not_after = now + lifetime;

        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(|e| issuance_error(e.to_string()))?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ca_pem: self.ca_pem.clone(),
            validity,
        })
    }

    fn root_pem(&self) -> String {
        self.ca_pem.clone()
    }
}

/// Short-lived identity of a service: its certificate and request signing key.
#[derive(Clone)]
pub struct Credentials {
    pub service_id: String,
    /// Identifies the signing key in the trust store.
    pub key_id: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
    pub expires_at: Instant,
    signing_key: Arc<[u8]>,
}

impl Credentials {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("service_id", &self.service_id)
            .field("key_id", &self.key_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Request attributes a signature covers besides the body.
///
/// Not transmitted: the verifier rebuilds it from the request it received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub method: String,
    /// Path and query, e.g. `/orders?id=7`.
    pub path: String,
    /// Logical service the request is addressed to.
    pub target: String,
}

impl RequestScope {
    pub fn new(method: &Method, path: &str, target: &str) -> Self {
        Self {
            method: method.as_str().to_string(),
            path: path.to_string(),
            target: target.to_string(),
        }
    }
}

/// A payload with its signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub service_id: String,
    pub key_id: String,
    pub timestamp_ms: u64,
    pub scope: RequestScope,
    pub payload: Bytes,
    /// Hex-encoded HMAC-SHA256.
    pub signature: String,
}

impl SignedPayload {
    /// Writes the signature headers.
    pub fn write_headers(&self, headers: &mut HeaderMap) -> Result<(), SecurityError> {
        let value = |v: &str| {
            HeaderValue::from_str(v)
                .map_err(|e| SecurityError::InvalidSignature(format!("unencodable header: {}", e)))
        };
        headers.insert(HEADER_CALLER, value(&self.service_id)?);
        headers.insert(HEADER_KEY_ID, value(&self.key_id)?);
        headers.insert(HEADER_TIMESTAMP, value(&self.timestamp_ms.to_string())?);
        headers.insert(HEADER_SIGNATURE, value(&self.signature)?);
        Ok(())
    }

    /// Reads the signature headers of an inbound request.
    pub fn from_headers(
        headers: &HeaderMap,
        scope: RequestScope,
        payload: Bytes,
    ) -> Result<Self, SecurityError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| SecurityError::InvalidSignature(format!("missing {} header", name)))
        };
        let timestamp_ms = header(HEADER_TIMESTAMP)?
            .parse()
            .map_err(|_| SecurityError::InvalidSignature("malformed timestamp".to_string()))?;
        Ok(Self {
            service_id: header(HEADER_CALLER)?,
            key_id: header(HEADER_KEY_ID)?,
            timestamp_ms,
            scope,
            payload,
            signature: header(HEADER_SIGNATURE)?,
        })
    }
}

/// Published whenever a service's credentials are replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEvent {
    pub service_id: String,
    pub key_id: String,
    pub previous_key_id: Option<String>,
}

struct TrustedKey {
    service_id: String,
    key: Arc<[u8]>,
    valid_until: Instant,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn mac(
    key: &[u8],
    service_id: &str,
    key_id: &str,
    timestamp_ms: u64,
    scope: &RequestScope,
    payload: &[u8],
) -> Result<HmacSha256, SecurityError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SecurityError::InvalidSignature(format!("unusable signing key: {}", e)))?;
    let timestamp = timestamp_ms.to_string();
    for field in [
        service_id,
        key_id,
        timestamp.as_str(),
        scope.method.as_str(),
        scope.path.as_str(),
        scope.target.as_str(),
    ] {
        mac.update(field.as_bytes());
        mac.update(b"\n");
    }
    mac.update(payload);
    Ok(mac)
}

/// Security layer shared by the mesh client and the proxy listener.
pub struct SecurityLayer {
    config: SecurityConfig,
    ca: Arc<dyn CertificateAuthority>,
    tokens: Option<Arc<dyn TokenValidator>>,
    credentials: DashMap<String, Arc<Credentials>>,
    trust: DashMap<String, TrustedKey>,
    rotations: broadcast::Sender<RotationEvent>,
}

impl SecurityLayer {
    pub fn new(
        config: SecurityConfig,
        ca: Arc<dyn CertificateAuthority>,
        tokens: Option<Arc<dyn TokenValidator>>,
    ) -> Self {
        let (rotations, _) = broadcast::channel(16);
        Self {
            config,
            ca,
            tokens,
            credentials: DashMap::new(),
            trust: DashMap::new(),
            rotations,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// PEM of the mesh root.
    pub fn root_pem(&self) -> String {
        self.ca.root_pem()
    }

    /// Subscribes to credential rotations.
    pub fn subscribe_rotations(&self) -> broadcast::Receiver<RotationEvent> {
        self.rotations.subscribe()
    }

    /// Current credentials of a service, if any were issued.
    pub fn current(&self, service_id: &str) -> Option<Arc<Credentials>> {
        self.credentials.get(service_id).map(|c| Arc::clone(c.value()))
    }

    /// Returns valid credentials for `service_id`, issuing them if needed.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::CertificateIssuance` if the CA fails.
    pub async fn establish_mtls(&self, service_id: &str) -> Result<Arc<Credentials>, SecurityError> {
        if let Some(current) = self.current(service_id) {
            if !current.is_expired() {
                return Ok(current);
            }
        }
        self.rotate(service_id).await
    }

    /// Issues fresh credentials. The previous ones stay valid for the grace
    /// period, or until they expire if that is sooner.
    pub async fn rotate(&self, service_id: &str) -> Result<Arc<Credentials>, SecurityError> {
        let issued = self
            .ca
            .issue(service_id, self.config.validity())
            .await
            .map_err(|e| {
                error!(service_id = %service_id, error = %e, "certificate issuance failed");
                e
            })?;

        let mut signing_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut signing_key);
        let signing_key: Arc<[u8]> = signing_key.into();

        let now = Instant::now();
        let credentials = Arc::new(Credentials {
            service_id: service_id.to_string(),
            key_id: uuid::Uuid::new_v4().to_string(),
            cert_pem: issued.cert_pem,
            key_pem: issued.key_pem,
            ca_pem: issued.ca_pem,
            expires_at: now + issued.validity,
            signing_key: Arc::clone(&signing_key),
        });

        self.trust.insert(
            credentials.key_id.clone(),
            TrustedKey {
                service_id: service_id.to_string(),
                key: signing_key,
                valid_until: credentials.expires_at,
            },
        );

        let previous = self
            .credentials
            .insert(service_id.to_string(), Arc::clone(&credentials));
        if let Some(previous) = &previous {
            if let Some(mut trusted) = self.trust.get_mut(&previous.key_id) {
                trusted.valid_until = trusted.valid_until.min(now + self.config.grace_period);
            }
        }
        self.prune_trust(now);

        let event = RotationEvent {
            service_id: service_id.to_string(),
            key_id: credentials.key_id.clone(),
            previous_key_id: previous.map(|p| p.key_id.clone()),
        };
        info!(
            service_id = %service_id,
            key_id = %event.key_id,
            previous = ?event.previous_key_id,
            "credentials issued"
        );
        let _ = self.rotations.send(event);
        Ok(credentials)
    }

    /// Drops keys that expired more than a grace period ago.
    fn prune_trust(&self, now: Instant) {
        let grace = self.config.grace_period;
        self.trust.retain(|_, k| k.valid_until + grace > now);
    }

    /// Signs a request to `scope` carrying `payload` with the credentials'
    /// signing key.
    pub fn sign_request(
        &self,
        scope: RequestScope,
        payload: Bytes,
        credentials: &Credentials,
    ) -> Result<SignedPayload, SecurityError> {
        self.sign_at(scope, payload, credentials, unix_millis())
    }

    fn sign_at(
        &self,
        scope: RequestScope,
        payload: Bytes,
        credentials: &Credentials,
        timestamp_ms: u64,
    ) -> Result<SignedPayload, SecurityError> {
        let signature = mac(
            &credentials.signing_key,
            &credentials.service_id,
            &credentials.key_id,
            timestamp_ms,
            &scope,
            &payload,
        )?
        .finalize()
        .into_bytes();

        Ok(SignedPayload {
            service_id: credentials.service_id.clone(),
            key_id: credentials.key_id.clone(),
            timestamp_ms,
            scope,
            payload,
            signature: hex::encode(signature),
        })
    }

    /// Verifies a signed payload and returns the payload.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` for unknown keys, identity mismatches, bad MACs or
    ///   timestamps further than `max_clock_skew` from now
    /// - `ExpiredCredential` when the key is past its validity or grace window
    pub fn verify_request(&self, signed: &SignedPayload) -> Result<Bytes, SecurityError> {
        let (key, service_id, valid_until) = {
            let trusted = self.trust.get(&signed.key_id).ok_or_else(|| {
                SecurityError::InvalidSignature(format!("unknown key id {}", signed.key_id))
            })?;
            (Arc::clone(&trusted.key), trusted.service_id.clone(), trusted.valid_until)
        };

        if service_id != signed.service_id {
            warn!(
                claimed = %signed.service_id,
                owner = %service_id,
                "signing key used for another identity"
            );
            return Err(SecurityError::InvalidSignature(
                "key does not belong to caller".to_string(),
            ));
        }

        let signature = hex::decode(&signed.signature)
            .map_err(|_| SecurityError::InvalidSignature("signature is not hex".to_string()))?;
        mac(
            &key,
            &signed.service_id,
            &signed.key_id,
            signed.timestamp_ms,
            &signed.scope,
            &signed.payload,
        )?
        .verify_slice(&signature)
        .map_err(|_| SecurityError::InvalidSignature("signature mismatch".to_string()))?;

        let skew = unix_millis().abs_diff(signed.timestamp_ms);
        if u128::from(skew) > self.config.max_clock_skew.as_millis() {
            warn!(
                caller = %signed.service_id,
                skew_ms = skew,
                "signature timestamp outside the accepted window"
            );
            return Err(SecurityError::InvalidSignature(format!(
                "timestamp is {}ms away from now",
                skew
            )));
        }

        if Instant::now() >= valid_until {
            return Err(SecurityError::ExpiredCredential {
                key_id: signed.key_id.clone(),
            });
        }

        debug!(caller = %signed.service_id, key_id = %signed.key_id, "request signature verified");
        Ok(signed.payload.clone())
    }

    /// Validates a bearer token through the configured issuer.
    ///
    /// Without a validator every token is rejected.
    pub async fn validate_token(&self, token: &str) -> Result<Claims, TokenError> {
        match &self.tokens {
            Some(validator) => validator.validate(token).await,
            None => Err(TokenError::NotConfigured),
        }
    }

    /// Returns true if token validation is configured.
    pub fn has_token_validator(&self) -> bool {
        self.tokens.is_some()
    }

    /// Services holding credentials.
    pub fn services(&self) -> Vec<String> {
        self.credentials.iter().map(|e| e.key().clone()).collect()
    }

    /// Rotates every service's credentials each `cert_rotation` until
    /// shutdown.
    pub async fn run_rotation(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.config.cert_rotation;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for service_id in self.services() {
                        if let Err(e) = self.rotate(&service_id).await {
                            warn!(service_id = %service_id, error = %e, "rotation failed, keeping current credentials");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping certificate rotation");
                    break;
                }
            }
        }
    }
}
