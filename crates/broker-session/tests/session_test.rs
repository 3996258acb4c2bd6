//! End-to-end session tests over real sockets
//!
//! Each test starts a proxy listener running the session engine and a
//! backend listener, then drives a client connection through them. The
//! backends read until end of stream before answering, so every successful
//! exchange also proves the client's half-close reached the backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use broker_router::{RouteError, RouteRegistry, Scheme, VirtualHostRoute};
use broker_session::{SessionConfig, SessionEngine, SessionError, SessionMode, SessionSummary};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

type SessionResult = Result<SessionSummary, SessionError>;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

#[derive(Clone, Copy)]
enum Mode {
    Http,
    Passthrough,
}

async fn start_proxy(
    scheme: Scheme,
    routes: Vec<VirtualHostRoute>,
    mode: Mode,
) -> (SocketAddr, mpsc::UnboundedReceiver<SessionResult>) {
    let registry = routes
        .into_iter()
        .fold(RouteRegistry::builder(), |builder, route| builder.route(scheme, route))
        .build()
        .unwrap();
    let engine = Arc::new(SessionEngine::new(
        Arc::new(registry),
        scheme,
        SessionConfig::default(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, peer)) = listener.accept().await {
            let engine = engine.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match mode {
                    Mode::Http => engine.serve_http(socket, peer).await,
                    Mode::Passthrough => engine.serve_passthrough(socket, peer).await,
                };
                let _ = tx.send(result);
            });
        }
    });

    (addr, rx)
}

/// Backend that reads until end of stream, then answers and closes
async fn start_backend(invert: bool) -> (u16, tokio::task::JoinHandle<(Vec<u8>, TcpListener)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();

        let mut response = RESPONSE.to_vec();
        if invert {
            received.iter_mut().for_each(|b| *b = !*b);
            response.iter_mut().for_each(|b| *b = !*b);
        }
        conn.write_all(&response).await.unwrap();
        (received, listener)
    });

    (port, handle)
}

/// Send `request`, half-close, and collect everything the proxy sends back
async fn send_request(proxy: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(request).await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    let _ = client.read_to_end(&mut response).await;
    response
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[tokio::test]
async fn test_injects_forwarding_headers() {
    let (port, backend) = start_backend(false).await;
    let (proxy, mut results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", port)],
        Mode::Http,
    )
    .await;

    let response =
        send_request(proxy, b"GET /index.html HTTP/1.1\r\nHost: a.example.com\r\n\r\n").await;
    assert_eq!(response, RESPONSE);

    let (received, _) = backend.await.unwrap();
    let received = text(&received);
    assert!(received.starts_with("GET /index.html HTTP/1.1\r\nHost: a.example.com\r\n"));
    assert!(received.contains("X-Real-IP: 127.0.0.1\r\n"));
    assert!(received.contains("X-Forwarded-For: 127.0.0.1\r\n"));
    assert_eq!(received.matches("X-Forwarded-For").count(), 1);

    let summary = results.recv().await.unwrap().unwrap();
    assert_eq!(summary.routed_host, "a.example.com");
    assert_eq!(summary.mode, SessionMode::HttpRelay);
    assert_eq!(summary.bytes_to_client, RESPONSE.len() as u64);
    assert_eq!(summary.bytes_to_backend, received.len() as u64);
}

#[tokio::test]
async fn test_prepends_to_existing_forwarded_for() {
    let (port, backend) = start_backend(false).await;
    let (proxy, _results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", port)],
        Mode::Http,
    )
    .await;

    send_request(
        proxy,
        b"GET / HTTP/1.1\r\nHost: a.example.com\r\nX-Forwarded-For: 1.2.3.4\r\n\r\n",
    )
    .await;

    let (received, _) = backend.await.unwrap();
    let received = text(&received);
    assert!(received.contains("X-Forwarded-For: 127.0.0.1,1.2.3.4\r\n"));
    assert_eq!(received.matches("X-Forwarded-For").count(), 1);
}

#[tokio::test]
async fn test_strips_route_prefix() {
    let (port, backend) = start_backend(false).await;
    let (proxy, _results) = start_proxy(
        Scheme::Http,
        vec![
            VirtualHostRoute::new("a.example.com", "127.0.0.1", 1),
            VirtualHostRoute::new("a.example.com", "127.0.0.1", port).with_prefix("/api"),
        ],
        Mode::Http,
    )
    .await;

    let response =
        send_request(proxy, b"GET /api/users?id=7 HTTP/1.1\r\nHost: a.example.com\r\n\r\n").await;
    assert_eq!(response, RESPONSE);

    let (received, _) = backend.await.unwrap();
    assert!(text(&received).starts_with("GET /users?id=7 HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_keep_alive_reuses_backend() {
    let (port, backend) = start_backend(false).await;
    let (proxy, _results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", port)],
        Mode::Http,
    )
    .await;

    let request = b"POST /a HTTP/1.1\r\nHost: a.example.com\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nhello\r\n0\r\n\r\n\
PUT /b HTTP/1.1\r\nHost: other.example.com\r\nContent-Length: 5\r\n\r\nworld\
GET /c HTTP/1.1\r\nHost: a.example.com\r\n\r\n";
    send_request(proxy, request).await;

    let (received, listener) = backend.await.unwrap();
    let received = text(&received);

    // three heads, each rewritten once, bodies untouched
    assert_eq!(received.matches("X-Real-IP: 127.0.0.1").count(), 3);
    assert!(received.contains("\r\n\r\n5\r\nhello\r\n0\r\n\r\nPUT /b HTTP/1.1\r\n"));
    assert!(received.contains("Host: other.example.com\r\n"));
    assert!(received.contains("\r\n\r\nworldGET /c HTTP/1.1\r\n"));

    // the second host was not routed again
    let second = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(second.is_err());
}

#[tokio::test]
async fn test_websocket_upgrade_switches_to_raw_copy() {
    let (port, backend) = start_backend(false).await;
    let (proxy, mut results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", port)],
        Mode::Http,
    )
    .await;

    let upgrade = b"GET /ws HTTP/1.1\r\nHost: a.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
    let raw = b"\x81\x02hiGET /raw HTTP/1.1\r\nHost: x\r\n\r\n\x88\x00";
    let mut request = upgrade.to_vec();
    request.extend_from_slice(raw);
    send_request(proxy, &request).await;

    let (received, _) = backend.await.unwrap();
    assert!(received.ends_with(raw));
    assert_eq!(text(&received).matches("X-Real-IP").count(), 1);

    let summary = results.recv().await.unwrap().unwrap();
    assert_eq!(summary.mode, SessionMode::WebsocketTunnel);
}

#[tokio::test]
async fn test_secure_mode_backend() {
    let (port, backend) = start_backend(true).await;
    let (proxy, _results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", port).with_secure_mode(true)],
        Mode::Http,
    )
    .await;

    let response = send_request(proxy, b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n").await;
    assert_eq!(response, RESPONSE);

    // the backend decoded what it received
    let (received, _) = backend.await.unwrap();
    let received = text(&received);
    assert!(received.starts_with("GET / HTTP/1.1\r\n"));
    assert!(received.contains("X-Real-IP: 127.0.0.1\r\n"));
}

#[tokio::test]
async fn test_response_arrives_before_client_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let backend = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            conn.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        conn.write_all(RESPONSE).await.unwrap();
        conn.shutdown().await.unwrap();

        // the backend's FIN does not close the client -> backend direction
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let (proxy, _results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", port)],
        Mode::Http,
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, RESPONSE);

    client
        .write_all(b"POST /late HTTP/1.1\r\nHost: a.example.com\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let rest = backend.await.unwrap();
    assert!(text(&rest).starts_with("POST /late HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_unknown_host_is_dropped() {
    let (proxy, mut results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", 1)],
        Mode::Http,
    )
    .await;

    let response = send_request(proxy, b"GET / HTTP/1.1\r\nHost: b.example.com\r\n\r\n").await;
    assert!(response.is_empty());

    let result = results.recv().await.unwrap();
    assert!(matches!(
        result,
        Err(SessionError::Route(RouteError::NotFound(host))) if host == "b.example.com"
    ));
}

#[tokio::test]
async fn test_suffix_fallback_routes_subdomain() {
    let (port, backend) = start_backend(false).await;
    let (proxy, mut results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("example.com", "127.0.0.1", port)],
        Mode::Http,
    )
    .await;

    let response = send_request(proxy, b"GET / HTTP/1.1\r\nHost: api.example.com\r\n\r\n").await;
    assert_eq!(response, RESPONSE);
    backend.await.unwrap();

    let summary = results.recv().await.unwrap().unwrap();
    assert_eq!(summary.routed_host, "api.example.com");
}

#[tokio::test]
async fn test_backend_unreachable() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let (proxy, mut results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", port)],
        Mode::Http,
    )
    .await;

    let response = send_request(proxy, b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n").await;
    assert!(response.is_empty());
    assert!(matches!(
        results.recv().await.unwrap(),
        Err(SessionError::Connect { .. })
    ));
}

#[tokio::test]
async fn test_passthrough_replays_client_hello() {
    let (port, backend) = start_backend(false).await;
    let (proxy, mut results) = start_proxy(
        Scheme::Https,
        vec![VirtualHostRoute::new("tls.example.com", "127.0.0.1", port)],
        Mode::Passthrough,
    )
    .await;

    let mut stream = client_hello("tls.example.com");
    stream.extend_from_slice(b"\x17\x03\x03\x00\x02ab");
    let response = send_request(proxy, &stream).await;
    assert_eq!(response, RESPONSE);

    let (received, _) = backend.await.unwrap();
    assert_eq!(received, stream);

    let summary = results.recv().await.unwrap().unwrap();
    assert_eq!(summary.routed_host, "tls.example.com");
    assert_eq!(summary.bytes_to_backend, stream.len() as u64);
}

#[tokio::test]
async fn test_passthrough_without_sni() {
    let (proxy, mut results) = start_proxy(
        Scheme::Https,
        vec![VirtualHostRoute::new("tls.example.com", "127.0.0.1", 1)],
        Mode::Passthrough,
    )
    .await;

    send_request(proxy, b"GET / HTTP/1.1\r\nHost: tls.example.com\r\n\r\n").await;
    assert!(matches!(
        results.recv().await.unwrap(),
        Err(SessionError::Sni(_))
    ));
}

/// Minimal single-record ClientHello carrying `hostname` as SNI
fn client_hello(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();

    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(0x00);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = vec![0x00, 0x00];
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0u8; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[tokio::test]
async fn test_trailing_line_breaks_are_forwarded() {
    let (port, backend) = start_backend(false).await;
    let (proxy, mut results) = start_proxy(
        Scheme::Http,
        vec![VirtualHostRoute::new("a.example.com", "127.0.0.1", port)],
        Mode::Http,
    )
    .await;

    let response =
        send_request(proxy, b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n\r\n\r\n").await;
    assert_eq!(response, RESPONSE);

    let (received, _) = backend.await.unwrap();
    let received = text(&received);
    assert!(received.ends_with("X-Forwarded-For: 127.0.0.1\r\n\r\n\r\n\r\n"));

    let summary = results.recv().await.unwrap().unwrap();
    assert_eq!(summary.mode, SessionMode::HttpRelay);
    assert_eq!(summary.bytes_to_backend, received.len() as u64);
}
