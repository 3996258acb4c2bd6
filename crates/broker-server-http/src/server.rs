//! Plaintext and secure-mode HTTP listeners
use std::net::SocketAddr;
use std::sync::Arc;

use broker_connection::SecureStream;
use broker_session::SessionEngine;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::{bind, HttpServerError};

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
        }
    }
}

/// Plaintext HTTP listener
pub struct HttpServer {
    config: HttpServerConfig,
    engine: Arc<SessionEngine>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, engine: Arc<SessionEngine>) -> Self {
        Self { config, engine }
    }

    /// Bind and serve until the task is dropped
    pub async fn start(self) -> Result<(), HttpServerError> {
        let listener = bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        info!("HTTP server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New HTTP connection from {}", peer_addr);
                    let engine = self.engine.clone();

                    tokio::spawn(async move {
                        if let Err(e) = engine.serve_http(stream, peer_addr).await {
                            debug!("HTTP session error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                }
            }
        }
    }
}

/// Secure-alias listener: clients speak HTTP through the byte-inverting transform
pub struct SecureServer {
    config: HttpServerConfig,
    engine: Arc<SessionEngine>,
}

impl SecureServer {
    pub fn new(config: HttpServerConfig, engine: Arc<SessionEngine>) -> Self {
        Self { config, engine }
    }

    pub async fn start(self) -> Result<(), HttpServerError> {
        let listener = bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        info!("Secure HTTP server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New secure connection from {}", peer_addr);
                    let engine = self.engine.clone();

                    tokio::spawn(async move {
                        let client = SecureStream::new(stream);
                        if let Err(e) = engine.serve_http(client, peer_addr).await {
                            debug!("Secure session error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept secure connection: {}", e);
                }
            }
        }
    }
}
