//! Proxy sessions
//!
//! A session owns one client connection. It sniffs the routing key, dials the
//! backend once and relays both directions until each side has finished:
//!
//! ```text
//! Accepted -> Sniffing -> Routed -> Relaying -> (WebsocketTunnel) -> Closing -> Closed
//! ```
//!
//! The request side rewrites each HTTP request head on its way to the
//! backend. The response side is a raw copy.

pub mod chunked;
pub mod engine;
pub mod head;
pub mod pump;

pub use engine::{HandoffError, SessionEngine};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use broker_router::{RouteError, SniError, SniffError};
use thiserror::Error;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("HTTP sniff failed: {0}")]
    Sniff(#[from] SniffError),

    #[error("SNI sniff failed: {0}")]
    Sni(#[from] SniError),

    #[error("ClientHello carries no server name")]
    NoServerName,

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Failed to connect to backend {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to backend {0}")]
    ConnectTimeout(String),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Session tuning shared by every session of a listener
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Let `api.example.com` fall back to a route for `example.com`
    pub suffix_fallback: bool,
    /// Backend dial timeout, `None` to wait for the OS
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            suffix_fallback: true,
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// What a session is doing with the client's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Looking for the routing key
    Sniffing,
    /// Forwarding discrete HTTP requests
    HttpRelay,
    /// Raw duplex copy (WebSocket upgrade or TLS pass-through)
    WebsocketTunnel,
    /// Both directions finished
    Closed,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Sniffing => write!(f, "sniffing"),
            SessionMode::HttpRelay => write!(f, "http-relay"),
            SessionMode::WebsocketTunnel => write!(f, "tunnel"),
            SessionMode::Closed => write!(f, "closed"),
        }
    }
}

/// Outcome of a finished session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub peer: SocketAddr,
    pub routed_host: String,
    pub backend_addr: String,
    /// Last relay mode before closing
    pub mode: SessionMode,
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
    pub duration: Duration,
}
