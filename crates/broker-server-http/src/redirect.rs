//! Redirect-to-HTTPS listener
//!
//! Stateless: every request gets `303 See Other` pointing at the same host
//! and path over HTTPS.
use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{HeaderValue, HOST, LOCATION};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::{bind, HttpServerError};

#[derive(Debug, Clone)]
pub struct RedirectServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for RedirectServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
        }
    }
}

pub struct RedirectServer {
    config: RedirectServerConfig,
}

impl RedirectServer {
    pub fn new(config: RedirectServerConfig) -> Self {
        Self { config }
    }

    pub async fn start(self) -> Result<(), HttpServerError> {
        let listener = bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        info!("HTTPS redirect server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(async move {
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service_fn(redirect))
                            .await
                        {
                            debug!("Redirect connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept redirect connection: {}", e);
                }
            }
        }
    }
}

/// `https://<host><path>[?query]`
pub fn redirect_location(host: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("https://{host}{path}?{query}"),
        _ => format!("https://{host}{path}"),
    }
}

async fn redirect(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()));

    let location = host
        .map(|host| redirect_location(host, req.uri().path(), req.uri().query()))
        .and_then(|location| HeaderValue::from_str(&location).ok());

    let mut response = Response::new(Full::new(Bytes::new()));
    match location {
        Some(location) => {
            debug!("Redirecting {} to {:?}", req.uri(), location);
            *response.status_mut() = StatusCode::SEE_OTHER;
            response.headers_mut().insert(LOCATION, location);
        }
        None => {
            *response.status_mut() = StatusCode::BAD_REQUEST;
        }
    }
    Ok(response)
}
