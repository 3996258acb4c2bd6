//! HTTPS server implementation with TLS termination
//!
//! The ClientHello is sniffed first so connections for names without a
//! certificate are dropped before any handshake work. The sniffed bytes are
//! replayed into the TLS acceptor, and the decrypted stream is handed to the
//! session engine like any plaintext HTTP connection.
use std::net::SocketAddr;
use std::sync::Arc;

use broker_cert::{CertError, CertificateDispatcher};
use broker_connection::ReplayStream;
use broker_router::{sniff_client_hello, SniError};
use broker_session::{SessionEngine, SessionError};
use bytes::BytesMut;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum HttpsServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("SNI error: {0}")]
    Sni(#[from] SniError),

    #[error("TLS client sent no server name")]
    NoServerName,

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpsServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for HttpsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
        }
    }
}

pub struct HttpsServer {
    config: HttpsServerConfig,
    engine: Arc<SessionEngine>,
    dispatcher: Arc<CertificateDispatcher>,
}

impl HttpsServer {
    pub fn new(
        config: HttpsServerConfig,
        engine: Arc<SessionEngine>,
        dispatcher: Arc<CertificateDispatcher>,
    ) -> Self {
        Self {
            config,
            engine,
            dispatcher,
        }
    }

    /// Start the HTTPS server
    pub async fn start(self) -> Result<(), HttpsServerError> {
        let local_addr = self.config.bind_addr;
        let listener = TcpListener::bind(local_addr).await.map_err(|e| {
            HttpsServerError::BindError {
                address: local_addr.ip().to_string(),
                port: local_addr.port(),
                reason: e.to_string(),
            }
        })?;

        self.serve(listener).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpsServerError> {
        let tls_config = self.dispatcher.clone().server_config()?;
        let acceptor = TlsAcceptor::from(tls_config);

        info!(
            "HTTPS server listening on {} ({} certificates)",
            listener.local_addr()?,
            self.dispatcher.len()
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let acceptor = acceptor.clone();
                    let engine = self.engine.clone();
                    let dispatcher = self.dispatcher.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, peer_addr, acceptor, engine, dispatcher)
                                .await
                        {
                            debug!("HTTPS connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTPS connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        acceptor: TlsAcceptor,
        engine: Arc<SessionEngine>,
        dispatcher: Arc<CertificateDispatcher>,
    ) -> Result<(), HttpsServerError> {
        debug!("New HTTPS connection from {}", peer_addr);

        let mut client_hello = BytesMut::new();
        let server_name = match sniff_client_hello(&mut stream, &mut client_hello).await {
            Ok(sniff) => sniff.server_name,
            Err(e) => {
                warn!("Rejecting TLS client {}: {}", peer_addr, e);
                return Err(e.into());
            }
        };
        let Some(server_name) = server_name else {
            warn!("Rejecting TLS client {}: no server name", peer_addr);
            return Err(HttpsServerError::NoServerName);
        };

        if let Err(e) = dispatcher.lookup(&server_name) {
            warn!("Rejecting TLS client {}: {}", peer_addr, e);
            return Err(e.into());
        }

        let replay = ReplayStream::new(client_hello.freeze(), stream);
        let tls_stream = match acceptor.accept(replay).await {
            Ok(s) => s,
            Err(e) => {
                warn!("TLS handshake failed from {} for {}: {}", peer_addr, server_name, e);
                return Err(HttpsServerError::TlsError(format!(
                    "Handshake failed: {}",
                    e
                )));
            }
        };

        debug!("TLS handshake completed for {} ({})", peer_addr, server_name);

        engine.serve_http(tls_stream, peer_addr).await?;
        Ok(())
    }
}
