//! TLS support for SMTP

use anyhow::{anyhow, Result};
use postroom_common::config::TlsConfig;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load the certificate chain and key and create an acceptor for STARTTLS
pub fn create_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = File::open(&tls_config.cert_path).map_err(|e| {
        anyhow!(
            "Failed to open certificate file {}: {}",
            tls_config.cert_path.display(),
            e
        )
    })?;
    let certs: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in certificate file"));
    }
    info!("Loaded {} certificate(s)", certs.len());

    let key_file = File::open(&tls_config.key_path).map_err(|e| {
        anyhow!(
            "Failed to open key file {}: {}",
            tls_config.key_path.display(),
            e
        )
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| anyhow!("Failed to read private key: {}", e))?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_files_are_reported() {
        let config = TlsConfig {
            cert_path: PathBuf::from("/nonexistent/postroom/cert.pem"),
            key_path: PathBuf::from("/nonexistent/postroom/key.pem"),
        };
        let err = create_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("certificate file"));
    }
}
