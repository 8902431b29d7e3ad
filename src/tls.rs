//! Certificate loading for mutual TLS on the RPC server and CLI client.

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Name workers and the CLI expect in the scheduler's certificate.
pub const TLS_DOMAIN: &str = "patrick";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS {0} path not configured")]
    NotConfigured(&'static str),

    #[error("TLS file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read TLS file: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate, key, and CA read from disk.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_pem = read_pem(config.ca_cert_path.as_deref(), "CA certificate").await?;
        let cert_pem = read_pem(config.cert_path.as_deref(), "certificate").await?;
        let key_pem = read_pem(config.key_path.as_deref(), "private key").await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Presents our certificate and requires a client certificate signed by
    /// the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(TLS_DOMAIN)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

async fn read_pem(path: Option<&Path>, what: &'static str) -> Result<Vec<u8>, TlsError> {
    let path = path.ok_or(TlsError::NotConfigured(what))?;
    if !path.exists() {
        return Err(TlsError::NotFound(path.to_path_buf()));
    }
    Ok(fs::read(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_paths_are_reported_first() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::NotConfigured("CA certificate"))));
    }

    #[tokio::test]
    async fn nonexistent_files_are_reported() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/node.crt")),
            key_path: Some(PathBuf::from("/nonexistent/node.key")),
            allow_insecure: false,
        };
        let result = TlsIdentity::load(&config).await;
        assert!(matches!(
            result,
            Err(TlsError::NotFound(p)) if p == Path::new("/nonexistent/ca.crt")
        ));
    }
}
