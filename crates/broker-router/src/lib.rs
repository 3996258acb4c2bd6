//! Routing logic for the broker
//!
//! Handles virtual-host route lookup (exact, path prefix and suffix fallback),
//! HTTP `Host:` sniffing and TLS SNI sniffing. Sniffers never discard bytes:
//! everything read while looking for the routing key is kept for replay.

pub mod http;
pub mod registry;
pub mod sni;

pub use http::{sniff_http_host, HttpSniff, SniffError, MAX_SNIFF_BYTES};
pub use registry::{
    RouteError, RouteRegistry, RouteRegistryBuilder, RouteTable, Scheme, VirtualHostRoute,
};
pub use sni::{extract_sni, sniff_client_hello, ClientHelloSniff, SniError};

