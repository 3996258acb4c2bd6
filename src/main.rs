//! broker: virtual-host aware HTTP/HTTPS reverse proxy

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use broker_cert::CertificateDispatcher;
use broker_router::Scheme;
use broker_server_http::{
    HttpServer, HttpServerConfig, RedirectServer, RedirectServerConfig, SecureServer,
};
use broker_server_https::{HttpsServer, HttpsServerConfig};
use broker_server_tls::{TlsServer, TlsServerConfig};
use broker_session::SessionEngine;
use clap::{ArgAction, Parser};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::BrokerConfig;

#[derive(Parser, Debug)]
#[command(name = "broker")]
#[command(about = "Route HTTP and HTTPS connections to backends by virtual host", long_about = None)]
#[command(version = env!("GIT_TAG"))]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "BROKER_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Answer plaintext requests with a redirect to HTTPS
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    force_https: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!(
        "broker {} ({}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let config = BrokerConfig::load(&cli.config)?;
    let registry = Arc::new(config.route_registry()?);
    let session_config = config.session_config();

    let http_engine = Arc::new(SessionEngine::new(
        registry.clone(),
        Scheme::Http,
        session_config.clone(),
    ));
    let https_engine = Arc::new(SessionEngine::new(
        registry.clone(),
        Scheme::Https,
        session_config,
    ));

    let mut listeners: JoinSet<Result<()>> = JoinSet::new();

    let http_addr = config.listen_addr(config.general.port)?;
    if cli.force_https {
        let server = RedirectServer::new(RedirectServerConfig {
            bind_addr: http_addr,
        });
        listeners.spawn(async move { server.start().await.context("Redirect listener failed") });
    } else {
        let server = HttpServer::new(
            HttpServerConfig {
                bind_addr: http_addr,
            },
            http_engine.clone(),
        );
        listeners.spawn(async move { server.start().await.context("HTTP listener failed") });
    }

    if registry.table(Scheme::Https).is_empty() {
        warn!("No https routes configured, TLS termination disabled");
    } else {
        let dispatcher = Arc::new(
            CertificateDispatcher::from_routes(registry.all_https_routes())
                .context("Failed to load TLS certificates")?,
        );
        let server = HttpsServer::new(
            HttpsServerConfig {
                bind_addr: config.listen_addr(config.general.https_port)?,
            },
            https_engine.clone(),
            dispatcher,
        );
        listeners.spawn(async move { server.start().await.context("HTTPS listener failed") });
    }

    if let Some(port) = config.general.secure_port {
        let server = SecureServer::new(
            HttpServerConfig {
                bind_addr: config.listen_addr(port)?,
            },
            http_engine,
        );
        listeners
            .spawn(async move { server.start().await.context("Secure HTTP listener failed") });
    }

    if let Some(port) = config.general.tls_port {
        let server = TlsServer::new(
            TlsServerConfig {
                bind_addr: config.listen_addr(port)?,
            },
            https_engine,
        );
        listeners
            .spawn(async move { server.start().await.context("TLS passthrough listener failed") });
    }

    tokio::select! {
        Some(result) = listeners.join_next() => {
            let result = result.context("Listener task panicked").and_then(|r| r);
            if let Err(e) = result {
                error!("{:#}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    listeners.shutdown().await;
    info!("broker stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["broker"]).unwrap();
        assert!(cli.force_https);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_disable_force_https() {
        let cli = Cli::try_parse_from([
            "broker",
            "--config",
            "/etc/broker.yaml",
            "--force-https",
            "false",
        ])
        .unwrap();
        assert!(!cli.force_https);
        assert_eq!(cli.config, PathBuf::from("/etc/broker.yaml"));
    }
}
