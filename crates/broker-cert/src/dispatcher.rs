//! SNI certificate dispatch

use std::collections::HashMap;
use std::sync::Arc;

use broker_router::VirtualHostRoute;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, warn};

use crate::{CertError, Certificate};

/// Picks a certificate by the SNI hostname of each handshake
///
/// Names match exactly, ignoring ASCII case. Handshakes without SNI or for
/// an unknown name are refused.
#[derive(Debug, Default)]
pub struct CertificateDispatcher {
    certs: HashMap<String, Arc<CertifiedKey>>,
}

impl CertificateDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the certificate of every route
    ///
    /// For a domain listed more than once the last route's certificate wins.
    pub fn from_routes(routes: &[VirtualHostRoute]) -> Result<Self, CertError> {
        let mut dispatcher = Self::new();

        for route in routes {
            let (cert_path, key_path) = match (&route.certificate_path, &route.key_path) {
                (Some(cert), Some(key)) => (cert, key),
                _ => return Err(CertError::MissingCertificate(route.domain.clone())),
            };

            let certificate = Certificate::load(cert_path, key_path)?;
            dispatcher.insert(&route.domain, certificate)?;
        }

        Ok(dispatcher)
    }

    /// Register `certificate` for `domain`, replacing any previous one
    pub fn insert(&mut self, domain: &str, certificate: Certificate) -> Result<(), CertError> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&certificate.private_key)?;
        let key = CertifiedKey::new(certificate.cert_chain, signing_key);

        if self
            .certs
            .insert(domain.to_ascii_lowercase(), Arc::new(key))
            .is_some()
        {
            warn!("Replacing certificate for {}", domain);
        }
        Ok(())
    }

    pub fn lookup(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CertError> {
        self.certs
            .get(&server_name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| CertError::NoCertificate(server_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// TLS server configuration resolving certificates through this dispatcher
    pub fn server_config(self: Arc<Self>) -> Result<Arc<ServerConfig>, CertError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(self);

        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

impl ResolvesServerCert for CertificateDispatcher {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            debug!("TLS handshake without SNI");
            return None;
        };

        match self.lookup(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }
}
