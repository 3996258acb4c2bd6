//! TLS listener with SNI pass-through routing
pub mod server;

pub use server::{TlsServer, TlsServerConfig, TlsServerError};
