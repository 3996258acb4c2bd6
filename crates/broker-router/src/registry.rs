//! Route registry for virtual-host routing
//!
//! Routes are kept in configuration order and never mutated after startup.
//! Lookup rules:
//! - a route with a non-empty path prefix that matches the request path wins
//!   immediately (first match in configuration order)
//! - otherwise the last domain-only route for the host is used
//! - the suffix fallback lets `api.example.com` reach a route for `example.com`

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{trace, warn};

/// Listener family a route belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext HTTP (also served on the secure-alias port)
    Http,
    /// TLS-terminated HTTPS and SNI pass-through
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// One configured virtual host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHostRoute {
    /// Hostname clients connect to (exact match key)
    pub domain: String,
    /// Optional path prefix, stripped before forwarding
    pub path_prefix: String,
    /// Resolved backend host (IP or DNS name)
    pub backend_host: String,
    /// Resolved backend port
    pub backend_port: u16,
    /// PEM certificate chain (HTTPS routes only)
    pub certificate_path: Option<PathBuf>,
    /// PEM private key (HTTPS routes only)
    pub key_path: Option<PathBuf>,
    /// Wrap the backend connection in the byte transform
    pub secure_mode: bool,
}

impl VirtualHostRoute {
    pub fn new(domain: impl Into<String>, backend_host: impl Into<String>, backend_port: u16) -> Self {
        Self {
            domain: domain.into(),
            path_prefix: String::new(),
            backend_host: backend_host.into(),
            backend_port,
            certificate_path: None,
            key_path: None,
            secure_mode: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    pub fn with_certificate(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.certificate_path = Some(cert.into());
        self.key_path = Some(key.into());
        self
    }

    pub fn with_secure_mode(mut self, secure_mode: bool) -> Self {
        self.secure_mode = secure_mode;
        self
    }

    /// Backend address in `host:port` form, bracketing IPv6 literals
    pub fn backend_addr(&self) -> String {
        if self.backend_host.contains(':') && !self.backend_host.starts_with('[') {
            format!("[{}]:{}", self.backend_host, self.backend_port)
        } else {
            format!("{}:{}", self.backend_host, self.backend_port)
        }
    }

    pub fn has_prefix(&self) -> bool {
        !self.path_prefix.is_empty()
    }
}

/// Route registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Route not found for host: {0}")]
    NotFound(String),

    #[error("Invalid route for domain {domain:?}: {reason}")]
    InvalidRoute { domain: String, reason: String },
}

/// Ordered list of routes for one listener family
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<VirtualHostRoute>,
}

impl RouteTable {
    pub fn new(routes: Vec<VirtualHostRoute>) -> Self {
        Self { routes }
    }

    /// Exact-domain lookup with path prefix preference
    pub fn lookup(&self, host: &str, path: &str) -> Result<&VirtualHostRoute, RouteError> {
        let host = host.trim();
        let mut fallback = None;

        for route in &self.routes {
            if route.domain != host {
                continue;
            }

            if !route.has_prefix() {
                // no break: a later domain-only route replaces this one
                fallback = Some(route);
            } else if path.starts_with(&route.path_prefix) {
                trace!("Prefix match {} for {}{}", route.path_prefix, host, path);
                return Ok(route);
            }
        }

        fallback.ok_or_else(|| RouteError::NotFound(host.to_string()))
    }

    /// Lookup with subdomain delegation
    ///
    /// Falls back to the shortest configured domain `d` such that `host`
    /// ends with `.d`.
    pub fn lookup_with_suffix(
        &self,
        host: &str,
        path: &str,
    ) -> Result<&VirtualHostRoute, RouteError> {
        let host = host.trim();
        match self.lookup(host, path) {
            Err(RouteError::NotFound(_)) => {}
            other => return other,
        }

        let parent = self
            .routes
            .iter()
            .map(|route| route.domain.as_str())
            .filter(|domain| is_parent_domain(domain, host))
            .min_by_key(|domain| domain.len())
            .ok_or_else(|| RouteError::NotFound(host.to_string()))?;

        trace!("Suffix fallback {} -> {}", host, parent);
        self.lookup(parent, path)
            .map_err(|_| RouteError::NotFound(host.to_string()))
    }

    /// Lookup used by sessions
    pub fn resolve(
        &self,
        host: &str,
        path: &str,
        suffix_fallback: bool,
    ) -> Result<&VirtualHostRoute, RouteError> {
        if suffix_fallback {
            self.lookup_with_suffix(host, path)
        } else {
            self.lookup(host, path)
        }
    }

    pub fn routes(&self) -> &[VirtualHostRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn is_parent_domain(domain: &str, host: &str) -> bool {
    if domain.is_empty() || domain.len() >= host.len() {
        return false;
    }
    host.strip_suffix(domain)
        .is_some_and(|head| head.ends_with('.'))
}

/// Immutable registry of HTTP and HTTPS routes
#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    http: RouteTable,
    https: RouteTable,
}

impl RouteRegistry {
    pub fn builder() -> RouteRegistryBuilder {
        RouteRegistryBuilder::default()
    }

    pub fn table(&self, scheme: Scheme) -> &RouteTable {
        match scheme {
            Scheme::Http => &self.http,
            Scheme::Https => &self.https,
        }
    }

    /// Every HTTPS route, in configuration order
    pub fn all_https_routes(&self) -> &[VirtualHostRoute] {
        self.https.routes()
    }

    pub fn total_count(&self) -> usize {
        self.http.len() + self.https.len()
    }
}

/// Collects routes in configuration order and validates them once
#[derive(Debug, Default)]
pub struct RouteRegistryBuilder {
    http: Vec<VirtualHostRoute>,
    https: Vec<VirtualHostRoute>,
}

impl RouteRegistryBuilder {
    pub fn route(mut self, scheme: Scheme, route: VirtualHostRoute) -> Self {
        match scheme {
            Scheme::Http => self.http.push(route),
            Scheme::Https => self.https.push(route),
        }
        self
    }

    pub fn build(self) -> Result<RouteRegistry, RouteError> {
        for (scheme, routes) in [(Scheme::Http, &self.http), (Scheme::Https, &self.https)] {
            validate_routes(routes)?;
            warn_duplicate_domains(scheme, routes);
        }

        Ok(RouteRegistry {
            http: RouteTable::new(self.http),
            https: RouteTable::new(self.https),
        })
    }
}

fn validate_routes(routes: &[VirtualHostRoute]) -> Result<(), RouteError> {
    for route in routes {
        let invalid = |reason: &str| RouteError::InvalidRoute {
            domain: route.domain.clone(),
            reason: reason.to_string(),
        };

        if route.domain.trim().is_empty() {
            return Err(invalid("empty domain"));
        }
        if route.domain.trim() != route.domain {
            return Err(invalid("domain has surrounding whitespace"));
        }
        if route.backend_host.is_empty() {
            return Err(invalid("empty backend host"));
        }
        if route.backend_port == 0 {
            return Err(invalid("backend port 0"));
        }
    }
    Ok(())
}

fn warn_duplicate_domains(scheme: Scheme, routes: &[VirtualHostRoute]) {
    let mut domain_only: HashMap<&str, usize> = HashMap::new();
    for route in routes.iter().filter(|r| !r.has_prefix()) {
        *domain_only.entry(route.domain.as_str()).or_default() += 1;
    }

    for (domain, count) in domain_only {
        if count > 1 {
            warn!(
                "{} routes: {} domain-only entries for {}, the last one wins",
                scheme, count, domain
            );
        }
    }
}
