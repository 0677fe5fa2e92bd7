//! TLS configuration for Streamgate
//!
//! Per virtual cluster there are two independent TLS bundles: the material
//! presented to downstream clients, and the trust used towards the upstream
//! cluster. Both are loaded once at startup; failures are fatal.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{GateError, Result};

/// TLS material presented to downstream clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamTlsConfig {
    /// Path to the certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Path to the private key (PEM)
    pub key_path: PathBuf,
}

/// TLS used towards the upstream cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTlsConfig {
    /// Path to the CA bundle used to verify the upstream (PEM)
    pub ca_cert_path: PathBuf,
}

impl DownstreamTlsConfig {
    /// Build a rustls server config from the PEM files
    pub fn build_server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| GateError::Tls(format!("invalid downstream certificate: {e}")))?;
        Ok(Arc::new(config))
    }
}

impl UpstreamTlsConfig {
    /// Build a rustls client config trusting the configured CA bundle
    pub fn build_client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(&self.ca_cert_path)? {
            roots
                .add(cert)
                .map_err(|e| GateError::Tls(format!("invalid upstream CA certificate: {e}")))?;
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

fn load_certs(path: &PathBuf) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let pem = std::fs::File::open(path)
        .map_err(|e| GateError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(pem);
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs =
        certs.map_err(|e| GateError::Tls(format!("cannot parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(GateError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &PathBuf) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let pem = std::fs::File::open(path)
        .map_err(|e| GateError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GateError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| GateError::Tls(format!("no private key found in {}", path.display())))
}
