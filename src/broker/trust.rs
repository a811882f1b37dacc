//! Broker trust: certificate pinning and identity announcements.
//!
//! # Verification order
//!
//! 1. Standard WebPKI chain validation against the configured CA bundle.
//! 2. SHA-256 comparison of the presented leaf certificate with the pin.
//! 3. After connecting, the retained identity announcement must name the
//!    expected broker.
//!
//! A verified identity is cached per network attachment and dropped whenever
//! the attachment changes or the session is torn down.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};

use super::transport::BrokerSession;
use super::{ConnectionError, TrustError};
use crate::config::{IdentityConfig, TlsConfig};

// =============================================================================
// Certificate digest
// =============================================================================

/// SHA-256 digest of a DER certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertDigest([u8; 32]);

impl CertDigest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest of a DER-encoded certificate.
    pub fn of(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for CertDigest {
    type Err = TrustError;

    /// Accepts plain hex or colon-separated pairs, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != ':').collect();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TrustError::InvalidDigest(format!("'{s}' is not hex")));
        }
        if hex.len() != 64 {
            return Err(TrustError::InvalidDigest(format!(
                "expected 64 hex digits, got {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| TrustError::InvalidDigest(format!("'{s}' is not hex")))?;
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for CertDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CertDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CertDigest({self})")
    }
}

/// Compare a presented leaf digest with an optional pin.
pub fn check_pin(
    pin: Option<&CertDigest>,
    presented: Option<CertDigest>,
) -> Result<(), TrustError> {
    match pin {
        None => Ok(()),
        Some(expected) if presented.as_ref() == Some(expected) => Ok(()),
        Some(expected) => Err(TrustError::PinMismatch {
            expected: *expected,
            presented,
        }),
    }
}

// =============================================================================
// Identity announcement
// =============================================================================

/// Extract the announced broker identifier.
///
/// JSON objects carry it in `broker_id` (or `id`); anything else is taken as
/// the trimmed UTF-8 payload.
pub fn parse_identity_announcement(payload: &[u8]) -> Option<String> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(payload) {
        return map
            .get("broker_id")
            .or_else(|| map.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
    }
    let text = std::str::from_utf8(payload).ok()?.trim();
    (!text.is_empty()).then(|| text.trim_matches('"').to_string())
}

/// Check an announcement payload against the expected identifier.
pub fn verify_announcement(expected: &str, payload: &[u8]) -> Result<(), TrustError> {
    let announced = parse_identity_announcement(payload).unwrap_or_default();
    if announced == expected {
        Ok(())
    } else {
        Err(TrustError::IdentityMismatch {
            expected: expected.to_string(),
            announced,
        })
    }
}

// =============================================================================
// Broker identity
// =============================================================================

/// Per-link trust fact: who the broker must be and where that was last checked.
#[derive(Debug, Clone)]
pub struct BrokerIdentity {
    identity: Option<IdentityConfig>,
    pin: Option<CertDigest>,
    verified_for: Option<String>,
}

impl BrokerIdentity {
    pub fn new(identity: Option<IdentityConfig>, pin: Option<CertDigest>) -> Self {
        Self {
            identity,
            pin,
            verified_for: None,
        }
    }

    pub fn pin(&self) -> Option<CertDigest> {
        self.pin
    }

    /// Nothing to verify: no identity topic and no pin.
    pub fn is_trivial(&self) -> bool {
        self.identity.is_none() && self.pin.is_none()
    }

    pub fn is_verified_for(&self, network_key: &str) -> bool {
        self.verified_for.as_deref() == Some(network_key)
    }

    pub fn is_verified(&self) -> bool {
        self.verified_for.is_some()
    }

    pub fn invalidate(&mut self) {
        self.verified_for = None;
    }

    /// Check the pin and the retained announcement on `session`.
    ///
    /// On success the result is cached for `network_key`; on failure any
    /// earlier verification is dropped.
    pub async fn verify(
        &mut self,
        session: &dyn BrokerSession,
        network_key: &str,
    ) -> Result<(), ConnectionError> {
        self.verified_for = None;
        check_pin(self.pin.as_ref(), session.peer_certificate())?;
        if let Some(identity) = &self.identity {
            let payload = session
                .await_retained(&identity.topic, identity.timeout)
                .await?;
            verify_announcement(&identity.expected_id, &payload)?;
        }
        self.verified_for = Some(network_key.to_string());
        Ok(())
    }
}

// =============================================================================
// Pinned TLS verifier
// =============================================================================

/// Leaf digest seen during the most recent handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerObservation {
    seen: Arc<Mutex<Option<CertDigest>>>,
}

impl PeerObservation {
    pub fn record(&self, digest: CertDigest) {
        *self.seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(digest);
    }

    pub fn last(&self) -> Option<CertDigest> {
        *self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Chain validation first, then the leaf digest pin.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pin: Option<CertDigest>,
    observation: PeerObservation,
}

impl PinnedCertVerifier {
    pub fn new(
        inner: Arc<WebPkiServerVerifier>,
        pin: Option<CertDigest>,
        observation: PeerObservation,
    ) -> Self {
        Self {
            inner,
            pin,
            observation,
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        let digest = CertDigest::of(end_entity.as_ref());
        self.observation.record(digest);
        if let Err(e) = check_pin(self.pin.as_ref(), Some(digest)) {
            tracing::warn!(error = %e, "Rejecting broker certificate");
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Load CA certificates from a PEM bundle.
pub fn load_roots(tls: &TlsConfig) -> Result<RootCertStore, TrustError> {
    let pem = std::fs::read(&tls.ca_file).map_err(|e| {
        TrustError::Tls(format!("cannot read '{}': {e}", tls.ca_file.display()))
    })?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| TrustError::Tls(format!("bad PEM: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| TrustError::Tls(format!("bad CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TrustError::Tls(format!(
            "no certificates in '{}'",
            tls.ca_file.display()
        )));
    }
    Ok(roots)
}

/// Client TLS configuration with the pinned verifier installed.
pub fn build_client_config(
    tls: &TlsConfig,
    pin: Option<CertDigest>,
    observation: PeerObservation,
) -> Result<Arc<ClientConfig>, TrustError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = load_roots(tls)?;
    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| TrustError::Tls(e.to_string()))?;
    let verifier = Arc::new(PinnedCertVerifier::new(inner, pin, observation));

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TrustError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
