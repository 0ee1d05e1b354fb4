//! Proxy Certificate Authority
//!
//! The intercepting proxy terminates TLS with per-host leaf certificates
//! minted on demand from a configured CA. CA material arrives as a PEM
//! blob, a hex-encoded blob or a file path; the `cert` subcommand generates
//! a fresh 10-year self-signed CA for first-time setups.

use std::collections::HashMap;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use crate::error::{Error, Result};

fn ensure_crypto_provider_installed() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve CA material from a PEM blob, a hex-encoded blob or a file path,
/// in that detection order.
pub fn load_ca_material(input: &str) -> Result<Vec<u8>> {
    if input.contains("-----BEGIN") {
        return Ok(input.as_bytes().to_vec());
    }

    // Hex only wins when the input cannot be a path.
    if !input.contains('/') && !input.contains('\\') {
        if let Ok(bytes) = hex::decode(input.trim()) {
            if !bytes.is_empty() {
                return Ok(bytes);
            }
        }
    }

    if Path::new(input).exists() {
        return Ok(std::fs::read(input)?);
    }

    Err(Error::Certificate(format!(
        "CA material is neither PEM, hex nor a readable file: {input}"
    )))
}

/// Signing authority for intercepted hosts.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    /// host → ready-to-use TLS server config, so repeat CONNECTs skip the
    /// signing work.
    minted: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl CertificateAuthority {
    /// Load a CA from PEM-encoded certificate and private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        ensure_crypto_provider_installed();

        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Certificate(format!("failed to parse CA key: {e}")))?;
        // Recreate the signing certificate from its own PEM; what matters
        // for issuing leaves is the issuer name and key.
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| Error::Certificate(format!("failed to parse CA certificate: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| Error::Certificate(format!("failed to rebuild CA certificate: {e}")))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem.to_string(),
            minted: Mutex::new(HashMap::new()),
        })
    }

    /// PEM of the CA certificate, for trust-store injection.
    pub fn cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// DER of the CA certificate.
    pub fn cert_der(&self) -> Result<CertificateDer<'static>> {
        let mut reader = BufReader::new(self.ca_cert_pem.as_bytes());
        let cert = rustls_pemfile::certs(&mut reader)
            .next()
            .transpose()
            .map_err(|e| Error::Certificate(format!("failed to re-read CA certificate: {e}")))?
            .ok_or_else(|| Error::Certificate("CA PEM holds no certificate".into()));
        cert
    }

    /// TLS server config presenting a leaf certificate for `host`.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<rustls::ServerConfig>> {
        let host = host.rsplit_once(':').map_or(host, |(h, _)| h);

        if let Some(config) = self.minted.lock().get(host) {
            return Ok(Arc::clone(config));
        }

        debug!(host, "minting leaf certificate");
        let config = Arc::new(self.mint(host)?);
        self.minted
            .lock()
            .insert(host.to_string(), Arc::clone(&config));
        Ok(config)
    }

    fn mint(&self, host: &str) -> Result<rustls::ServerConfig> {
        ensure_crypto_provider_installed();

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("failed to generate leaf key: {e}")))?;
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| Error::Certificate(format!("invalid host for certificate: {e}")))?;
        params.distinguished_name.push(DnType::CommonName, host);
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| Error::Certificate(format!("failed to sign leaf certificate: {e}")))?;

        let cert_chain = vec![leaf.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| Error::Certificate(format!("invalid leaf certificate: {e}")))
    }
}

/// Generate a self-signed CA valid for ten years and write it as PEM.
///
/// The key is ECDSA P-256; see DESIGN.md for the choice.
pub fn generate_ca(cert_path: &Path, key_path: &Path) -> Result<()> {
    ensure_crypto_provider_installed();

    let key = KeyPair::generate()
        .map_err(|e| Error::Certificate(format!("failed to generate CA key: {e}")))?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::OrganizationName, "fetchurl Proxy CA");
    params.distinguished_name.push(DnType::CommonName, "fetchurl CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = rcgen::date_time_ymd(2026, 1, 1);
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::Certificate(format!("failed to create CA certificate: {e}")))?;

    std::fs::write(cert_path, cert.pem())?;
    std::fs::write(key_path, key.serialize_pem())?;
    Ok(())
}

/// Load a CA from configured `--ca-cert`/`--ca-key` inputs.
pub fn load_ca(cert_input: &str, key_input: &str) -> Result<CertificateAuthority> {
    let cert = load_ca_material(cert_input)?;
    let key = load_ca_material(key_input)?;
    let cert_pem = String::from_utf8(cert)
        .map_err(|_| Error::Certificate("CA certificate is not valid UTF-8 PEM".into()))?;
    let key_pem = String::from_utf8(key)
        .map_err(|_| Error::Certificate("CA key is not valid UTF-8 PEM".into()))?;
    CertificateAuthority::from_pem(&cert_pem, &key_pem)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca-key.pem");

        generate_ca(&cert_path, &key_path).unwrap();
        assert!(cert_path.is_file());
        assert!(key_path.is_file());

        let ca = load_ca(
            cert_path.to_str().unwrap(),
            key_path.to_str().unwrap(),
        )
        .unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        ca.cert_der().unwrap();
    }

    #[test]
    fn test_mint_leaf_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca-key.pem");
        generate_ca(&cert_path, &key_path).unwrap();
        let ca = load_ca(cert_path.to_str().unwrap(), key_path.to_str().unwrap()).unwrap();

        let first = ca.server_config_for("example.com:443").unwrap();
        let second = ca.server_config_for("example.com").unwrap();
        // Port-stripped host hits the mint cache.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_load_ca_material_pem_passthrough() {
        let pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n";
        assert_eq!(load_ca_material(pem).unwrap(), pem.as_bytes());
    }

    #[test]
    fn test_load_ca_material_hex() {
        let bytes = load_ca_material("deadbeef").unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_load_ca_material_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("material.pem");
        std::fs::write(&path, b"some bytes").unwrap();
        assert_eq!(
            load_ca_material(path.to_str().unwrap()).unwrap(),
            b"some bytes"
        );
    }

    #[test]
    fn test_load_ca_material_rejects_garbage() {
        assert!(load_ca_material("/does/not/exist").is_err());
    }
}
