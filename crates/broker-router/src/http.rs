//! HTTP `Host:` sniffing
//!
//! Reads the start of a plaintext HTTP connection until the `Host:` header
//! is found. Every byte read is appended to the caller's replay buffer so the
//! request can be forwarded to the backend untouched.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// Bytes that may be buffered before a `Host:` line must have been seen
pub const MAX_SNIFF_BYTES: usize = 4096;

const READ_CHUNK: usize = 2048;

/// HTTP sniffing errors
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid http header, {0} bytes buffered without a Host field")]
    HeaderTooLarge(usize),

    #[error("Invalid host field in http header: {0}")]
    MalformedHost(String),

    #[error("Invalid request line: {0}")]
    MalformedRequestLine(String),

    #[error("Host header not found")]
    HostNotFound,

    #[error("Empty hostname")]
    EmptyHost,
}

/// Routing key found at the start of an HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSniff {
    /// Hostname without port
    pub host: String,
    /// Request path of the first request
    pub path: String,
}

/// Read from `reader` into `buffer` until the first request's `Host:` line.
///
/// Bytes already present in `buffer` are scanned first. On success `buffer`
/// holds everything consumed from the reader, in order.
pub async fn sniff_http_host<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<HttpSniff, SniffError>
where
    R: AsyncRead + Unpin,
{
    let mut scanned = 0;
    let mut path: Option<String> = None;

    loop {
        while let Some(pos) = buffer[scanned..].iter().position(|b| *b == b'\n') {
            let line_end = scanned + pos;
            if line_end >= MAX_SNIFF_BYTES {
                return Err(SniffError::HeaderTooLarge(line_end + 1));
            }
            let line = trim_cr(&buffer[scanned..line_end]);
            scanned = line_end + 1;

            match path {
                None if line.is_empty() => continue,
                None => {
                    path = Some(parse_request_path(line)?);
                }
                Some(ref request_path) => {
                    if line.is_empty() {
                        debug!("End of header block without Host field");
                        return Err(SniffError::HostNotFound);
                    }
                    if let Some(host) = parse_host_line(line)? {
                        trace!("Sniffed Host {} after {} bytes", host, scanned);
                        return Ok(HttpSniff {
                            host,
                            path: request_path.clone(),
                        });
                    }
                }
            }
        }

        if buffer.len() > MAX_SNIFF_BYTES {
            return Err(SniffError::HeaderTooLarge(buffer.len()));
        }

        buffer.reserve(READ_CHUNK);
        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            return Err(SniffError::EmptyHost);
        }
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Extract the path from a request line (`METHOD SP target SP version`)
fn parse_request_path(line: &[u8]) -> Result<String, SniffError> {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_whitespace();

    let target = match (parts.next(), parts.next()) {
        (Some(_method), Some(target)) => target,
        _ => return Err(SniffError::MalformedRequestLine(text.into_owned())),
    };

    Ok(request_target_path(target).to_string())
}

/// Path component of a request target in origin or absolute form
pub fn request_target_path(target: &str) -> &str {
    if target.starts_with('/') {
        return target;
    }

    match target.split_once("://") {
        Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => "/",
    }
}

/// Parse a header line, returning the host if it is a `Host:` line.
///
/// The line split on `:` must give two fields (`Host: name`) or three
/// (`Host: name:port`); anything else is rejected.
fn parse_host_line(line: &[u8]) -> Result<Option<String>, SniffError> {
    if line.len() < 6 || !line[..5].eq_ignore_ascii_case(b"host:") {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(line);
    let fields: Vec<&str> = text.split(':').collect();
    if fields.len() != 2 && fields.len() != 3 {
        return Err(SniffError::MalformedHost(text.into_owned()));
    }

    let host = fields[1].trim();
    if host.is_empty() {
        return Err(SniffError::EmptyHost);
    }

    Ok(Some(host.to_string()))
}
