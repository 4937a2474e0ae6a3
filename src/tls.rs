//! TLS/certificate handling for keyrelay.
//!
//! This module provides:
//! - Self-signed certificate generation (ECDSA P-256) for the relay and for
//!   client identities
//! - Certificate loading and saving
//! - SHA-256 fingerprint computation and parsing
//! - rustls configuration builders: the server demands a client certificate
//!   and derives the client's identity from it, clients pin the server by
//!   fingerprint

use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DistinguishedName, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::identity::PublicIdentity;

/// File names for the relay's auto-generated certificate.
const CERT_FILENAME: &str = "cert.pem";
const KEY_FILENAME: &str = "key.pem";

/// File names for a client identity.
const IDENTITY_CERT_FILENAME: &str = "identity.pem";
const IDENTITY_KEY_FILENAME: &str = "identity.key";

/// Error type for TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Result type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Certificate chain and private key with computed fingerprint.
#[derive(Clone)]
pub struct CertKeyPair {
    /// Certificate chain in DER format. Never empty.
    pub cert_der: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
    /// SHA-256 fingerprint of the leaf certificate (colon-separated hex).
    pub fingerprint: String,
}

impl CertKeyPair {
    fn from_pem(cert_pem: &str, key_pem: &str) -> TlsResult<Self> {
        let cert_der = parse_cert_pem(cert_pem)?;
        let key = parse_key_pem(key_pem)?;
        let fingerprint = compute_fingerprint(&cert_der[0]);

        Ok(Self {
            cert_der,
            key: Arc::new(key),
            fingerprint,
        })
    }

    /// The relay identity this certificate authenticates as.
    pub fn identity(&self) -> PublicIdentity {
        PublicIdentity::from_certificate(&self.cert_der[0])
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

/// Generates a self-signed ECDSA P-256 certificate.
///
/// Returns a tuple of (certificate PEM, private key PEM).
pub fn generate_self_signed_cert(subject: &str) -> TlsResult<(String, String)> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    let mut params = CertificateParams::new(vec![subject.to_string()])
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Generates an in-memory certificate without touching the filesystem.
pub fn generate_cert_key(subject: &str) -> TlsResult<CertKeyPair> {
    let (cert_pem, key_pem) = generate_self_signed_cert(subject)?;
    CertKeyPair::from_pem(&cert_pem, &key_pem)
}

/// Loads the relay certificate from the config directory, or generates one.
/// Returns (CertKeyPair, bool) where bool indicates if the certificate was newly generated.
pub fn load_or_generate_cert(config_dir: &Path) -> TlsResult<(CertKeyPair, bool)> {
    load_or_generate_cert_at_paths(
        &config_dir.join(CERT_FILENAME),
        &config_dir.join(KEY_FILENAME),
        "localhost",
    )
}

/// Loads a client identity from `dir`, or generates one.
pub fn load_or_generate_identity(dir: &Path) -> TlsResult<(CertKeyPair, bool)> {
    load_or_generate_cert_at_paths(
        &dir.join(IDENTITY_CERT_FILENAME),
        &dir.join(IDENTITY_KEY_FILENAME),
        "keyrelay-client",
    )
}

/// Loads a certificate and key from the specified paths.
pub fn load_cert_key(cert_path: &Path, key_path: &Path) -> TlsResult<CertKeyPair> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;
    CertKeyPair::from_pem(&cert_pem, &key_pem)
}

/// Loads a certificate and key from the specified paths, or generates new ones if not present.
/// Returns (CertKeyPair, was_generated).
pub fn load_or_generate_cert_at_paths(
    cert_path: &Path,
    key_path: &Path,
    subject: &str,
) -> TlsResult<(CertKeyPair, bool)> {
    if cert_path.exists() && key_path.exists() {
        return Ok((load_cert_key(cert_path, key_path)?, false));
    }

    for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
        fs::create_dir_all(parent)?;
    }

    let (cert_pem, key_pem) = generate_self_signed_cert(subject)?;
    fs::write(cert_path, &cert_pem)?;
    fs::write(key_path, &key_pem)?;

    // Private key is owner read/write only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    Ok((CertKeyPair::from_pem(&cert_pem, &key_pem)?, true))
}

fn parse_cert_pem(pem: &str) -> TlsResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::InvalidCertificate(
            "no certificates found in PEM".to_string(),
        ));
    }

    Ok(certs)
}

fn parse_key_pem(pem: &str) -> TlsResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?
        .ok_or_else(|| TlsError::InvalidCertificate("no private key found in PEM".to_string()))
}

/// Computes the SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns the fingerprint in colon-separated lowercase hex format.
pub fn compute_fingerprint(cert_der: &[u8]) -> String {
    let hash: [u8; 32] = Sha256::digest(cert_der).into();
    format_fingerprint(&hash)
}

/// Parses a fingerprint string in either colon-separated or continuous hex format.
///
/// Both formats are accepted (case-insensitive):
/// - Colon-separated: `aa:bb:cc:dd:...` (95 characters for 32 bytes)
/// - Continuous hex: `aabbccdd...` (64 characters)
pub fn parse_fingerprint(s: &str) -> TlsResult<[u8; 32]> {
    let s = s.trim();

    let hex_str = if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 32 || parts.iter().any(|part| part.len() != 2) {
            return Err(TlsError::InvalidFingerprint(format!(
                "expected 32 colon-separated hex bytes, got '{}'",
                s
            )));
        }
        parts.concat()
    } else {
        if s.len() != 64 {
            return Err(TlsError::InvalidFingerprint(format!(
                "continuous hex fingerprint must be 64 characters, got {}",
                s.len()
            )));
        }
        s.to_string()
    };

    let mut result = [0u8; 32];
    for (i, chunk) in hex_str.as_bytes().chunks(2).enumerate() {
        let hex_pair = std::str::from_utf8(chunk)
            .map_err(|_| TlsError::InvalidFingerprint("invalid UTF-8 in fingerprint".to_string()))?;
        result[i] = u8::from_str_radix(hex_pair, 16).map_err(|_| {
            TlsError::InvalidFingerprint(format!("invalid hex character in fingerprint: {}", hex_pair))
        })?;
    }

    Ok(result)
}

/// Formats a fingerprint as colon-separated lowercase hex.
pub fn format_fingerprint(bytes: &[u8; 32]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Builds the relay's TLS configuration. Every client must present a
/// certificate; any self-signed one is accepted.
pub fn build_server_config(cert_key: &CertKeyPair, alpn: &str) -> TlsResult<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(SelfSignedClientVerifier))
        .with_single_cert(cert_key.cert_der.clone(), cert_key.private_key())
        .map_err(|e| TlsError::TlsConfig(e.to_string()))?;

    config.alpn_protocols = vec![alpn.as_bytes().to_vec()];

    Ok(config)
}

/// Builds a client TLS configuration that pins the relay by fingerprint and
/// authenticates with `identity`.
pub fn build_client_config_fingerprint(
    fingerprint: &[u8; 32],
    identity: &CertKeyPair,
    alpn: &str,
) -> TlsResult<ClientConfig> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(*fingerprint)))
        .with_client_auth_cert(identity.cert_der.clone(), identity.private_key())
        .map_err(|e| TlsError::TlsConfig(e.to_string()))?;

    config.alpn_protocols = vec![alpn.as_bytes().to_vec()];

    Ok(config)
}

/// Builds a client TLS configuration with no relay verification (insecure, for development).
pub fn build_client_config_insecure(identity: &CertKeyPair, alpn: &str) -> TlsResult<ClientConfig> {
    tracing::warn!(
        "TLS certificate verification is disabled. This is insecure and should only be used for development."
    );

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_client_auth_cert(identity.cert_der.clone(), identity.private_key())
        .map_err(|e| TlsError::TlsConfig(e.to_string()))?;

    config.alpn_protocols = vec![alpn.as_bytes().to_vec()];

    Ok(config)
}

/// Identity of the peer on an established QUIC connection, taken from the
/// leaf certificate it presented.
pub fn peer_identity(connection: &quinn::Connection) -> Option<PublicIdentity> {
    let certs = connection
        .peer_identity()?
        .downcast::<Vec<CertificateDer<'static>>>()
        .ok()?;
    certs
        .first()
        .map(|leaf| PublicIdentity::from_certificate(leaf))
}

fn verify_tls12(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls12_signature(
        message,
        cert,
        dss,
        &rustls::crypto::ring::default_provider().signature_verification_algorithms,
    )
}

fn verify_tls13(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls13_signature(
        message,
        cert,
        dss,
        &rustls::crypto::ring::default_provider().signature_verification_algorithms,
    )
}

fn supported_schemes() -> Vec<SignatureScheme> {
    rustls::crypto::ring::default_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

/// Client certificate verifier for self-certifying identities.
///
/// There is no issuer to check against: the certificate only has to be
/// well-formed and the handshake signature proves the client holds its key.
#[derive(Debug)]
struct SelfSignedClientVerifier;

impl rustls::server::danger::ClientCertVerifier for SelfSignedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        if end_entity.as_ref().is_empty() {
            return Err(rustls::Error::General("empty client certificate".to_string()));
        }
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Custom certificate verifier that checks the certificate's SHA-256 fingerprint.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: [u8; 32],
}

impl FingerprintVerifier {
    fn new(expected: [u8; 32]) -> Self {
        Self { expected }
    }
}

impl rustls::client::danger::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let hash: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();

        if hash == self.expected {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                format_fingerprint(&self.expected),
                format_fingerprint(&hash)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Insecure certificate verifier that accepts any certificate (for development only).
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}
