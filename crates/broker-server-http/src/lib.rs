//! Plaintext HTTP listeners
//!
//! - [`HttpServer`] routes by `Host:` and relays to the backend
//! - [`SecureServer`] does the same for clients speaking the byte-inverted
//!   secure mode
//! - [`RedirectServer`] answers every request with a redirect to HTTPS

pub mod redirect;
pub mod server;

pub use redirect::{redirect_location, RedirectServer, RedirectServerConfig};
pub use server::{HttpServer, HttpServerConfig, SecureServer};

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;

#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpListener, HttpServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| HttpServerError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        })
}
