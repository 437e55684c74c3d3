//! rustls server configuration for the `ssl` and `wss` listeners.
//!
//! Certificates and keys are read from PEM files.  When a CA certificate is
//! configured, clients must present a certificate chaining to it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::infrastructure::network::listener::TlsSettings;
use crate::infrastructure::network::ServerError;

/// Builds an acceptor from `settings`.
///
/// # Errors
///
/// [`ServerError::Certificate`] when a PEM file cannot be read,
/// [`ServerError::Tls`] when its contents are unusable.
pub fn build_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, ServerError> {
    let certs = load_certs(&settings.cert)?;
    let key = load_key(&settings.key)?;

    let builder = ServerConfig::builder();
    let builder = match &settings.ca_cert {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for ca in load_certs(ca_path)? {
                roots
                    .add(ca)
                    .map_err(|e| ServerError::Tls(format!("{}: {e}", ca_path.display())))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| ServerError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, ServerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ServerError::Certificate {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ServerError::Certificate {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ServerError::Certificate {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ServerError::Tls(format!("{}: no private key found", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "devlink_tls_{}_{}",
            std::process::id(),
            name
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_missing_certificate_file_is_reported_with_path() {
        let settings = TlsSettings {
            cert: PathBuf::from("/nonexistent/devlink/server.pem"),
            key: PathBuf::from("/nonexistent/devlink/server.key"),
            ca_cert: None,
        };
        match build_acceptor(&settings) {
            Err(ServerError::Certificate { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/devlink/server.pem"))
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("acceptor built from missing files"),
        }
    }

    #[test]
    fn test_pem_without_certificates_is_rejected() {
        let cert = temp_file("empty.pem", "not a certificate\n");
        let key = temp_file("empty.key", "not a key\n");
        let settings = TlsSettings {
            cert: cert.clone(),
            key: key.clone(),
            ca_cert: None,
        };

        let result = build_acceptor(&settings);

        assert!(matches!(result, Err(ServerError::Tls(_))));
        std::fs::remove_file(cert).ok();
        std::fs::remove_file(key).ok();
    }
}
