//! TLS support for the relay server
//!
//! Certificates are supplied by the operator as PEM files; without them the
//! relay serves plain HTTP.

use axum_server::tls_rustls::RustlsConfig;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid certificate or key: {0}")]
    Config(#[source] std::io::Error),
}

/// Calculate SHA-256 fingerprint of a certificate in human-readable format
pub fn calculate_cert_fingerprint(cert_pem: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_pem.as_bytes());
    let result = hasher.finalize();

    // Colon-separated hex pairs, as browsers display them
    result
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Create RustlsConfig from PEM strings
pub async fn create_rustls_config(cert_pem: &str, key_pem: &str) -> Result<RustlsConfig, TlsError> {
    RustlsConfig::from_pem(cert_pem.as_bytes().to_vec(), key_pem.as_bytes().to_vec())
        .await
        .map_err(TlsError::Config)
}

/// Load certificate and key files; returns the config and the certificate fingerprint
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<(RustlsConfig, String), TlsError> {
    let cert_pem = tokio::fs::read_to_string(cert_path)
        .await
        .map_err(|source| TlsError::Read {
            path: cert_path.display().to_string(),
            source,
        })?;
    let key_pem = tokio::fs::read_to_string(key_path)
        .await
        .map_err(|source| TlsError::Read {
            path: key_path.display().to_string(),
            source,
        })?;

    let fingerprint = calculate_cert_fingerprint(&cert_pem);
    let config = create_rustls_config(&cert_pem, &key_pem).await?;
    info!(cert = %cert_path.display(), "Loaded TLS certificate");
    Ok((config, fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_calculation() {
        let cert = "-----BEGIN CERTIFICATE-----\ntest\n-----END CERTIFICATE-----";
        let fp = calculate_cert_fingerprint(cert);
        assert!(fp.contains(':'));
        assert_eq!(fp.len(), 95); // 32 bytes * 2 hex + 31 colons
        assert_eq!(fp, calculate_cert_fingerprint(cert));
    }

    #[tokio::test]
    async fn test_missing_files_reported() {
        let dir = tempdir().unwrap();
        let err = load_tls_config(&dir.path().join("server.crt"), &dir.path().join("server.key"))
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::Read { .. }));
        assert!(err.to_string().contains("server.crt"));
    }

    #[tokio::test]
    async fn test_garbage_pem_rejected() {
        let dir = tempdir().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();
        assert!(matches!(
            load_tls_config(&cert, &key).await,
            Err(TlsError::Config(_))
        ));
    }
}
