//! Session engine

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use broker_connection::{BoxedStream, BrokerStream, HalfCloser, SecureStream, SplitClose};
use broker_router::{sniff_client_hello, sniff_http_host, RouteRegistry, Scheme, VirtualHostRoute};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::chunked::ChunkedFramer;
use crate::head::{BodyFraming, RequestHead, MAX_HEAD_BYTES};
use crate::pump::pump;
use crate::{SessionConfig, SessionError, SessionMode, SessionSummary};

const READ_CHUNK: usize = 8 * 1024;

/// Routing failed before a backend was connected
#[derive(Debug, Clone, Error)]
#[error("backend handoff aborted: {0}")]
pub struct HandoffError(String);

/// Backend read side, passed from the request side to the response side
struct BackendReader {
    reader: ReadHalf<BoxedStream>,
    closer: Option<HalfCloser>,
}

type Handoff = Result<BackendReader, HandoffError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Http,
    Passthrough,
}

/// Values fixed once the session is routed
struct Routed {
    host: String,
    route: VirtualHostRoute,
    backend: BoxedStream,
    local_ip: IpAddr,
}

struct RequestSide {
    host: String,
    backend_addr: String,
    mode: SessionMode,
    bytes: u64,
}

/// Runs proxy sessions against one route table
#[derive(Debug, Clone)]
pub struct SessionEngine {
    registry: Arc<RouteRegistry>,
    scheme: Scheme,
    config: SessionConfig,
}

impl SessionEngine {
    pub fn new(registry: Arc<RouteRegistry>, scheme: Scheme, config: SessionConfig) -> Self {
        Self {
            registry,
            scheme,
            config,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Route by HTTP `Host:` and relay, rewriting each request head
    pub async fn serve_http<S>(&self, client: S, peer: SocketAddr) -> Result<SessionSummary, SessionError>
    where
        S: BrokerStream,
    {
        self.serve(client, peer, Protocol::Http).await
    }

    /// Route by TLS SNI and relay the ciphertext untouched
    pub async fn serve_passthrough<S>(
        &self,
        client: S,
        peer: SocketAddr,
    ) -> Result<SessionSummary, SessionError>
    where
        S: BrokerStream,
    {
        self.serve(client, peer, Protocol::Passthrough).await
    }

    async fn serve<S>(
        &self,
        client: S,
        peer: SocketAddr,
        protocol: Protocol,
    ) -> Result<SessionSummary, SessionError>
    where
        S: BrokerStream,
    {
        let started = Instant::now();
        let client_closer = client.half_closer();
        let (client_read, client_write) = tokio::io::split(client);
        let (handoff_tx, handoff_rx) = oneshot::channel();

        let request = async {
            let mut attempted = None;
            let result = self
                .request_side(client_read, client_closer, peer, protocol, handoff_tx, &mut attempted)
                .await;
            (attempted, result)
        };
        let response = response_side(handoff_rx, client_write, peer);

        let ((attempted, request_result), bytes_to_client) = tokio::join!(request, response);

        match request_result {
            Ok(side) => {
                trace!("Session {} {} -> {}", peer, side.mode, SessionMode::Closed);
                let summary = SessionSummary {
                    peer,
                    routed_host: side.host,
                    backend_addr: side.backend_addr,
                    mode: side.mode,
                    bytes_to_backend: side.bytes,
                    bytes_to_client,
                    duration: started.elapsed(),
                };
                info!(
                    "Session {} {} -> {} closed ({}, {} bytes up, {} bytes down, {:?})",
                    summary.peer,
                    summary.routed_host,
                    summary.backend_addr,
                    summary.mode,
                    summary.bytes_to_backend,
                    summary.bytes_to_client,
                    summary.duration
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(
                    "Session {} for host {} failed: {}",
                    peer,
                    attempted.as_deref().unwrap_or("<unknown>"),
                    e
                );
                Err(e)
            }
        }
    }

    async fn request_side<R>(
        &self,
        mut client: R,
        client_closer: Option<HalfCloser>,
        peer: SocketAddr,
        protocol: Protocol,
        handoff: oneshot::Sender<Handoff>,
        attempted: &mut Option<String>,
    ) -> Result<RequestSide, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK);

        let routed = match self
            .route(&mut client, &mut buffer, peer, protocol, attempted)
            .await
        {
            Ok(routed) => routed,
            Err(e) => {
                let _ = handoff.send(Err(HandoffError(e.to_string())));
                return Err(e);
            }
        };

        let backend_closer = routed.backend.half_closer();
        let (backend_read, mut backend_write) = tokio::io::split(routed.backend);
        if handoff
            .send(Ok(BackendReader {
                reader: backend_read,
                closer: backend_closer,
            }))
            .is_err()
        {
            debug!("Session {}: response side already gone", peer);
        }

        let mut bytes = 0u64;
        let result = match protocol {
            Protocol::Http => {
                trace!("Session {} {} -> {}", peer, SessionMode::Sniffing, SessionMode::HttpRelay);
                let rewrite = Rewrite {
                    peer,
                    local_ip: routed.local_ip,
                    prefix: &routed.route.path_prefix,
                };
                relay_requests(&mut client, &mut buffer, &mut backend_write, &rewrite, &mut bytes)
                    .await
            }
            Protocol::Passthrough => {
                trace!(
                    "Session {} {} -> {}",
                    peer,
                    SessionMode::Sniffing,
                    SessionMode::WebsocketTunnel
                );
                tunnel(&mut client, &mut buffer, &mut backend_write, &mut bytes).await
            }
        };

        // client -> backend is finished
        if let Err(e) = backend_write.shutdown().await {
            trace!("Session {}: backend write shutdown: {}", peer, e);
        }
        if let Err(e) = client_closer.close_read() {
            trace!("Session {}: client read close: {}", peer, e);
        }

        let mode = result?;
        Ok(RequestSide {
            host: routed.host,
            backend_addr: routed.route.backend_addr(),
            mode,
            bytes,
        })
    }

    /// Sniff the routing key, look up the route and dial the backend
    async fn route<R>(
        &self,
        client: &mut R,
        buffer: &mut BytesMut,
        peer: SocketAddr,
        protocol: Protocol,
        attempted: &mut Option<String>,
    ) -> Result<Routed, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let (host, path) = match protocol {
            Protocol::Http => {
                let sniff = sniff_http_host(client, buffer).await?;
                (sniff.host, sniff.path)
            }
            Protocol::Passthrough => {
                let sniff = sniff_client_hello(client, buffer).await?;
                let host = sniff.server_name.ok_or(SessionError::NoServerName)?;
                (host, "/".to_string())
            }
        };
        *attempted = Some(host.clone());

        let route = self
            .registry
            .table(self.scheme)
            .resolve(&host, &path, self.config.suffix_fallback)?
            .clone();

        debug!(
            "Routing {} {}{} to {} ({} table{})",
            peer,
            host,
            path,
            route.backend_addr(),
            self.scheme,
            if route.secure_mode { ", secure" } else { "" }
        );

        let (backend, local_ip) = self.dial(&route).await?;
        Ok(Routed {
            host,
            route,
            backend,
            local_ip,
        })
    }

    async fn dial(&self, route: &VirtualHostRoute) -> Result<(BoxedStream, IpAddr), SessionError> {
        let addr = route.backend_addr();
        let connect = TcpStream::connect(addr.as_str());

        let connected = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| SessionError::ConnectTimeout(addr.clone()))?,
            None => connect.await,
        };
        let stream = connected.map_err(|source| SessionError::Connect {
            addr: addr.clone(),
            source,
        })?;

        let local_ip = stream.local_addr()?.ip();
        if let Err(e) = stream.set_nodelay(true) {
            trace!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let backend: BoxedStream = if route.secure_mode {
            Box::new(SecureStream::new(stream))
        } else {
            Box::new(stream)
        };
        Ok((backend, local_ip))
    }
}

/// Backend -> client: raw copy once the backend is known
async fn response_side<W>(
    handoff: oneshot::Receiver<Handoff>,
    mut client: W,
    peer: SocketAddr,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut backend = match handoff.await {
        Ok(Ok(backend)) => backend,
        Ok(Err(e)) => {
            trace!("Session {}: {}", peer, e);
            return 0;
        }
        Err(_) => return 0,
    };

    let (bytes, result) = pump(&mut backend.reader, &mut client).await;
    if let Err(e) = result {
        debug!("Session {}: backend -> client copy ended: {}", peer, e);
    }

    if let Err(e) = client.shutdown().await {
        trace!("Session {}: client write shutdown: {}", peer, e);
    }
    if let Err(e) = backend.closer.close_read() {
        trace!("Session {}: backend read close: {}", peer, e);
    }
    bytes
}

struct Rewrite<'a> {
    peer: SocketAddr,
    local_ip: IpAddr,
    prefix: &'a str,
}

/// Client -> backend for HTTP: one request at a time until upgrade or close
async fn relay_requests<R, W>(
    client: &mut R,
    buffer: &mut BytesMut,
    backend: &mut W,
    rewrite: &Rewrite<'_>,
    sent: &mut u64,
) -> Result<SessionMode, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut encoded = BytesMut::new();

    loop {
        let Some(mut head) = read_head(client, buffer).await? else {
            // trailing line breaks after the last request still reach the backend
            if !buffer.is_empty() {
                backend.write_all(buffer).await?;
                *sent += buffer.len() as u64;
                buffer.clear();
            }
            return Ok(SessionMode::HttpRelay);
        };

        let upgrade = head.is_websocket_upgrade();
        let framing = if upgrade {
            BodyFraming::Empty
        } else {
            head.framing()?
        };

        head.rewrite(rewrite.peer.ip(), rewrite.local_ip, rewrite.prefix);
        encoded.clear();
        head.encode(&mut encoded);
        backend.write_all(&encoded).await?;
        *sent += encoded.len() as u64;
        trace!("Session {}: forwarded {} {}", rewrite.peer, head.method, head.target);

        if upgrade {
            trace!(
                "Session {} {} -> {}",
                rewrite.peer,
                SessionMode::HttpRelay,
                SessionMode::WebsocketTunnel
            );
            return tunnel(client, buffer, backend, sent).await;
        }

        match framing {
            BodyFraming::Empty => {}
            BodyFraming::Length(len) => forward_length(client, buffer, backend, len, sent).await?,
            BodyFraming::Chunked => forward_chunked(client, buffer, backend, sent).await?,
        }
    }
}

/// Read the next request head, `None` on a clean close between requests
///
/// On `None` the buffer may still hold whitespace sent after the last request.
async fn read_head<R>(client: &mut R, buffer: &mut BytesMut) -> Result<Option<RequestHead>, SessionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some((head, len)) = RequestHead::parse(buffer)? {
            buffer.advance(len);
            return Ok(Some(head));
        }
        if buffer.len() >= MAX_HEAD_BYTES {
            return Err(SessionError::HeadTooLarge(MAX_HEAD_BYTES));
        }

        buffer.reserve(READ_CHUNK);
        if client.read_buf(buffer).await? == 0 {
            if buffer.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            return Err(SessionError::Protocol(
                "connection closed inside a request head".to_string(),
            ));
        }
    }
}

async fn forward_length<R, W>(
    client: &mut R,
    buffer: &mut BytesMut,
    backend: &mut W,
    len: u64,
    sent: &mut u64,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;

    while remaining > 0 {
        if buffer.is_empty() {
            buffer.reserve(READ_CHUNK);
            if client.read_buf(buffer).await? == 0 {
                return Err(SessionError::Protocol(
                    "connection closed inside a request body".to_string(),
                ));
            }
        }

        let take = remaining.min(buffer.len() as u64) as usize;
        backend.write_all(&buffer[..take]).await?;
        buffer.advance(take);
        remaining -= take as u64;
        *sent += take as u64;
    }

    Ok(())
}

async fn forward_chunked<R, W>(
    client: &mut R,
    buffer: &mut BytesMut,
    backend: &mut W,
    sent: &mut u64,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framer = ChunkedFramer::new();

    loop {
        if !buffer.is_empty() {
            let take = framer.advance(buffer)?;
            backend.write_all(&buffer[..take]).await?;
            buffer.advance(take);
            *sent += take as u64;

            if framer.is_done() {
                return Ok(());
            }
        }

        buffer.reserve(READ_CHUNK);
        if client.read_buf(buffer).await? == 0 {
            return Err(SessionError::Protocol(
                "connection closed inside a chunked body".to_string(),
            ));
        }
    }
}

/// Flush buffered client bytes, then copy the client verbatim
async fn tunnel<R, W>(
    client: &mut R,
    buffer: &mut BytesMut,
    backend: &mut W,
    sent: &mut u64,
) -> Result<SessionMode, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !buffer.is_empty() {
        backend.write_all(buffer).await?;
        *sent += buffer.len() as u64;
        buffer.clear();
    }

    let (copied, result) = pump(client, backend).await;
    *sent += copied;
    result?;
    Ok(SessionMode::WebsocketTunnel)
}
