//! SNI pass-through listener
//!
//! Connections are routed by the server name in their ClientHello and the
//! ciphertext is relayed to the backend untouched, starting with the sniffed
//! hello itself. Certificates never come into play on this port.
use std::net::SocketAddr;
use std::sync::Arc;

use broker_session::SessionEngine;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum TlsServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for TlsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8444)),
        }
    }
}

pub struct TlsServer {
    config: TlsServerConfig,
    engine: Arc<SessionEngine>,
}

impl TlsServer {
    /// Create a new TLS server routing through `engine`'s HTTPS table
    pub fn new(config: TlsServerConfig, engine: Arc<SessionEngine>) -> Self {
        Self { config, engine }
    }

    /// Start the TLS server
    pub async fn start(self) -> Result<(), TlsServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| TlsServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), TlsServerError> {
        info!(
            "TLS server listening on {} (SNI passthrough routing, no certificate termination)",
            listener.local_addr()?
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Pass-through connection from {}", peer_addr);
                    let engine = self.engine.clone();

                    tokio::spawn(async move {
                        if let Err(e) = engine.serve_passthrough(socket, peer_addr).await {
                            debug!("Pass-through session from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept pass-through connection: {}", e);
                }
            }
        }
    }
}
