//! YAML configuration for the broker binary
//!
//! Backend hosts and ports may be given literally or by a symbolic name
//! declared in the `general.hosts` / `general.ports` tables. HTTPS routes
//! without explicit `cert`/`key` paths use the certificate directory
//! convention `<certspath>/<domain>_bundle.crt` + `<certspath>/<domain>.key`.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use broker_router::{RouteRegistry, Scheme, VirtualHostRoute};
use broker_session::SessionConfig;
use serde::Deserialize;
use tracing::{debug, info};

/// Top-level configuration file format
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Plaintext virtual hosts, in match order
    #[serde(default)]
    pub http: Vec<VirtualHostConfig>,

    /// TLS-terminated virtual hosts, in match order
    #[serde(default)]
    pub https: Vec<VirtualHostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Bind IP for every listener
    #[serde(default = "default_ip")]
    pub ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Secure-alias listener, disabled when absent
    pub secure_port: Option<u16>,

    /// SNI pass-through listener, disabled when absent
    pub tls_port: Option<u16>,

    /// Directory holding `<domain>_bundle.crt` / `<domain>.key` pairs
    pub certspath: Option<PathBuf>,

    #[serde(default = "default_suffix_fallback")]
    pub suffix_fallback: bool,

    /// Backend dial timeout; 0 disables it
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub hosts: Vec<NamedValue>,

    #[serde(default)]
    pub ports: Vec<NamedValue>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            https_port: default_https_port(),
            secure_port: None,
            tls_port: None,
            certspath: None,
            suffix_fallback: default_suffix_fallback(),
            connect_timeout_secs: default_connect_timeout(),
            hosts: Vec::new(),
            ports: Vec::new(),
        }
    }
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_suffix_fallback() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

/// Entry of the `hosts` / `ports` name tables
#[derive(Debug, Clone, Deserialize)]
pub struct NamedValue {
    pub name: String,
    pub value: Scalar,
}

/// A YAML scalar that may be written as a number or a string
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(u64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// One virtual host entry under `http:` or `https:`
#[derive(Debug, Clone, Deserialize)]
pub struct VirtualHostConfig {
    pub domain: String,

    /// Backend IP or a name from `general.hosts`
    pub host: String,

    /// Backend port or a name from `general.ports`
    pub port: Scalar,

    /// Path prefix matched and stripped before forwarding
    #[serde(default)]
    pub prefix: String,

    /// Apply the byte-inverting transform on the backend leg
    #[serde(default)]
    pub secure: bool,

    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl BrokerConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: BrokerConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.listen_ip()?;

        let mut ports = vec![("port", self.general.port)];
        if !self.https.is_empty() {
            ports.push(("https_port", self.general.https_port));
        }
        ports.extend(self.general.secure_port.map(|p| ("secure_port", p)));
        ports.extend(self.general.tls_port.map(|p| ("tls_port", p)));

        for (i, (name, port)) in ports.iter().enumerate() {
            if let Some((other, _)) = ports[..i].iter().find(|(_, p)| p == port) {
                bail!("Listener ports {} and {} are both {}", other, name, port);
            }
        }

        for route in self.http.iter().chain(&self.https) {
            if route.cert.is_some() != route.key.is_some() {
                bail!(
                    "Route '{}' must set both cert and key, or neither",
                    route.domain
                );
            }
        }

        Ok(())
    }

    fn listen_ip(&self) -> Result<IpAddr> {
        let ip = self.general.ip.trim();
        if ip.is_empty() {
            return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        ip.parse()
            .with_context(|| format!("Invalid listen ip '{}'", self.general.ip))
    }

    /// Socket address for a listener on `port`
    pub fn listen_addr(&self, port: u16) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.listen_ip()?, port))
    }

    pub fn session_config(&self) -> SessionConfig {
        let secs = self.general.connect_timeout_secs;
        SessionConfig {
            suffix_fallback: self.general.suffix_fallback,
            connect_timeout: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }

    /// Resolve names and certificate paths and build the route registry
    pub fn route_registry(&self) -> Result<RouteRegistry> {
        let names = NameTables::new(&self.general);
        let mut builder = RouteRegistry::builder();

        for entry in &self.http {
            builder = builder.route(Scheme::Http, names.route(entry)?);
        }

        for entry in &self.https {
            let mut route = names.route(entry)?;
            match (&entry.cert, &entry.key, &self.general.certspath) {
                (Some(cert), Some(key), _) => {
                    route = route.with_certificate(cert, key);
                }
                (None, None, Some(dir)) => {
                    let (cert, key) = broker_cert::bundle_paths(dir, &entry.domain);
                    route = route.with_certificate(cert, key);
                }
                _ => {
                    debug!("No certificate configured for {}", entry.domain);
                }
            }
            builder = builder.route(Scheme::Https, route);
        }

        let registry = builder.build()?;
        info!(
            "Loaded {} routes ({} http, {} https)",
            registry.total_count(),
            registry.table(Scheme::Http).len(),
            registry.table(Scheme::Https).len()
        );
        Ok(registry)
    }
}

/// `general.hosts` / `general.ports` lookups
struct NameTables {
    hosts: HashMap<String, String>,
    ports: HashMap<String, String>,
}

impl NameTables {
    fn new(general: &GeneralConfig) -> Self {
        let table = |entries: &[NamedValue]| {
            entries
                .iter()
                .map(|e| (e.name.clone(), e.value.to_string()))
                .collect()
        };

        Self {
            hosts: table(&general.hosts),
            ports: table(&general.ports),
        }
    }

    fn route(&self, entry: &VirtualHostConfig) -> Result<VirtualHostRoute> {
        let host = self.resolve_host(&entry.host)?;
        let port = self.resolve_port(&entry.port)?;

        let mut route =
            VirtualHostRoute::new(entry.domain.trim(), host, port).with_secure_mode(entry.secure);
        if !entry.prefix.is_empty() {
            route = route.with_prefix(entry.prefix.as_str());
        }
        Ok(route)
    }

    /// Name from the hosts table, otherwise an IP literal
    fn resolve_host(&self, host: &str) -> Result<String> {
        if let Some(value) = self.hosts.get(host) {
            return Ok(value.clone());
        }
        if host.parse::<IpAddr>().is_ok() {
            return Ok(host.to_string());
        }
        bail!("Can not find the value of host '{}'", host)
    }

    /// Name from the ports table, otherwise a port number
    fn resolve_port(&self, port: &Scalar) -> Result<u16> {
        let literal = match port {
            Scalar::Text(name) => self.ports.get(name).cloned().unwrap_or_else(|| name.clone()),
            Scalar::Number(n) => n.to_string(),
        };

        match literal.trim().parse::<u16>() {
            Ok(p) if p > 0 => Ok(p),
            _ => bail!("Can not find the value of port '{}'", port),
        }
    }
}
