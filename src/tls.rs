//! Self-signed certificate material for TLS-enabled fixtures.

use crate::error::{HarnessError, Result};
use rcgen::{CertificateParams, KeyPair};
use std::path::Path;

/// PEM-encoded certificate and private key for one fixture.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TlsMaterial {
    /// Generates a certificate valid for `localhost`, the loopback addresses and `host`.
    pub fn self_signed(host: &str) -> Result<Self> {
        let mut names = vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ];
        if !names.iter().any(|n| n == host) {
            names.push(host.to_string());
        }

        let params = CertificateParams::new(names).map_err(|e| HarnessError::Tls(e.to_string()))?;
        let key_pair = KeyPair::generate().map_err(|e| HarnessError::Tls(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| HarnessError::Tls(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Writes the certificate as `ca.crt` into `dir`, the layout `--cert-dir` expects.
    pub fn write_cert_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("ca.crt"), &self.cert_pem)?;
        Ok(())
    }
}

/// Installs the process-wide rustls crypto provider; later calls are no-ops.
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
