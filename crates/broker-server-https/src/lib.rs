//! HTTPS listener with TLS termination
pub mod server;

pub use server::{HttpsServer, HttpsServerConfig, HttpsServerError};
