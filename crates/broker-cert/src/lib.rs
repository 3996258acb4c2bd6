//! Certificate management for TLS termination
//!
//! Loads PEM certificate chains and private keys from disk and picks the
//! certificate for each handshake by SNI hostname.

pub mod dispatcher;

pub use dispatcher::CertificateDispatcher;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tracing::info;

/// Certificate errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("IO error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse certificate {}: {1}", .0.display())]
    InvalidCertificate(PathBuf, String),

    #[error("Failed to parse private key {}: {1}", .0.display())]
    InvalidKey(PathBuf, String),

    #[error("Route {0} has no certificate configured")]
    MissingCertificate(String),

    #[error("No certificate for server name {0:?}")]
    NoCertificate(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Load a certificate chain and private key from PEM files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_chain = load_certs(cert_path)?;
        let private_key = load_private_key(key_path)?;

        info!(
            "Certificate loaded from {} and {}",
            cert_path.display(),
            key_path.display()
        );

        Ok(Self::new(cert_chain, private_key))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidCertificate(path.to_path_buf(), e.to_string()))?;

    if certs.is_empty() {
        return Err(CertError::InvalidCertificate(
            path.to_path_buf(),
            "no certificates found".to_string(),
        ));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::InvalidKey(path.to_path_buf(), e.to_string()))?
        .ok_or_else(|| CertError::InvalidKey(path.to_path_buf(), "no private key found".to_string()))
}

/// Conventional certificate and key paths for `domain` under `certs_dir`
///
/// `<certs_dir>/<domain>_bundle.crt` and `<certs_dir>/<domain>.key`
pub fn bundle_paths(certs_dir: &Path, domain: &str) -> (PathBuf, PathBuf) {
    (
        certs_dir.join(format!("{domain}_bundle.crt")),
        certs_dir.join(format!("{domain}.key")),
    )
}
