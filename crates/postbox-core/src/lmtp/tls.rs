//! TLS material for STARTTLS
//!
//! One `rustls::ServerConfig` serves both listeners: the event-driven one
//! wraps it in a `tokio_rustls::TlsAcceptor`, the blocking one drives a
//! `rustls::ServerConnection` directly.

use anyhow::{anyhow, Result};
use postbox_common::config::{Config, TlsConfig};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Load the certificate chain and key into a server config
pub fn load_server_config(tls_config: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(&tls_config.cert_path)
        .map_err(|e| anyhow!("Failed to open certificate file: {}", e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?;

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in certificate file"));
    }

    info!(
        count = certs.len(),
        path = %tls_config.cert_path.display(),
        "Loaded TLS certificates"
    );

    let key_file =
        File::open(&tls_config.key_path).map_err(|e| anyhow!("Failed to open key file: {}", e))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| anyhow!("Failed to read private key: {}", e))?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;

    Ok(Arc::new(server_config))
}

pub fn acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

/// Both files of the configured pair exist
pub fn is_tls_configured(tls_config: &Option<TlsConfig>) -> bool {
    match tls_config {
        Some(config) => config.cert_path.exists() && config.key_path.exists(),
        None => false,
    }
}

/// Server config for the configured pair, or `None` when TLS is off or
/// the material cannot be loaded
pub fn from_config(config: &Config) -> Option<Arc<ServerConfig>> {
    if !config.lmtp.starttls || !is_tls_configured(&config.tls) {
        return None;
    }
    let tls_config = config.tls.as_ref()?;
    match load_server_config(tls_config) {
        Ok(server_config) => {
            info!("TLS configured successfully");
            Some(server_config)
        }
        Err(e) => {
            warn!(error = %e, "Failed to initialize TLS, STARTTLS will be disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_tls_not_configured() {
        assert!(!is_tls_configured(&None));
        let missing = TlsConfig {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        };
        assert!(!is_tls_configured(&Some(missing.clone())));
        assert!(load_server_config(&missing).is_err());

        let config = Config {
            tls: Some(missing),
            ..Config::default()
        };
        assert!(from_config(&config).is_none());
    }

    #[test]
    fn test_empty_certificate_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();
        let config = TlsConfig { cert_path, key_path };
        assert!(is_tls_configured(&Some(config.clone())));
        let err = load_server_config(&config).unwrap_err();
        assert!(err.to_string().contains("No certificates"));
    }
}
