//! Secure-channel material for TLS listeners.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::errors::{Result, ServerError};

/// Server certificate chain and key, ready to accept TLS connections.
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<rustls::ServerConfig>,
}

impl TlsConfig {
    /// Build from PEM-encoded certificate chain and private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = parse_certificates(cert_pem)?;
        if certs.is_empty() {
            return Err(ServerError::Tls("no certificates found".into()));
        }
        let key = parse_private_key(key_pem)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::Tls(format!("protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(format!("server config error: {e}")))?;

        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    /// Build from PEM files on disk.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert = std::fs::read(cert_path)?;
        let key = std::fs::read(key_path)?;
        Self::from_pem(&cert, &key)
    }

    /// Acceptor for inbound connections.
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server_config))
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {e}")))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| ServerError::Tls(format!("failed to parse private key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn self_signed() -> (Vec<u8>, Vec<u8>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        (
            certified.cert.pem().into_bytes(),
            certified.key_pair.serialize_pem().into_bytes(),
        )
    }

    #[test]
    fn builds_from_pem() {
        let (cert, key) = self_signed();
        let config = TlsConfig::from_pem(&cert, &key).unwrap();
        let _acceptor = config.acceptor();
    }

    #[test]
    fn builds_from_files() {
        let (cert, key) = self_signed();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();
        assert!(TlsConfig::from_files(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn missing_file_is_io_error() {
        assert_matches!(
            TlsConfig::from_files(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem")),
            Err(ServerError::Io(_))
        );
    }

    #[test]
    fn empty_certificate_pem_rejected() {
        let (_, key) = self_signed();
        assert_matches!(TlsConfig::from_pem(b"", &key), Err(ServerError::Tls(_)));
    }

    #[test]
    fn garbage_key_rejected() {
        let (cert, _) = self_signed();
        assert_matches!(TlsConfig::from_pem(&cert, b"not a key"), Err(ServerError::Tls(_)));
    }
}
