//! Request head parsing and rewriting
//!
//! Only the head of each request is interpreted. Bodies are forwarded as
//! they arrive, framed just enough to find where the next request starts.

use std::net::IpAddr;

use bytes::{BufMut, BytesMut};

use crate::SessionError;

/// Bytes allowed for one request head
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;

/// How the body following a request head is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body
    Empty,
    /// `Content-Length` bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
}

/// Owned copy of a parsed request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Parse a head from the start of `buf`
    ///
    /// Returns the head and its length in bytes, or `None` when more input
    /// is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, SessionError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let len = match request.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(SessionError::Protocol(format!("invalid request head: {e}"))),
        };

        let head = RequestHead {
            method: request.method.unwrap_or_default().to_string(),
            target: request.path.unwrap_or_default().to_string(),
            version: request.version.unwrap_or(1),
            headers: request
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        };

        Ok(Some((head, len)))
    }

    /// Values of every header named `name`
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn framing(&self) -> Result<BodyFraming, SessionError> {
        let mut codings = Vec::new();
        for value in self.header_values("transfer-encoding") {
            let value = String::from_utf8_lossy(value);
            codings.extend(
                value
                    .split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty()),
            );
        }

        if let Some(last) = codings.last() {
            if last == "chunked" {
                return Ok(BodyFraming::Chunked);
            }
            return Err(SessionError::Protocol(format!(
                "unsupported transfer-encoding {last:?}"
            )));
        }

        let mut length: Option<u64> = None;
        for value in self.header_values("content-length") {
            let parsed = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| SessionError::Protocol("invalid content-length".to_string()))?;

            if length.is_some_and(|l| l != parsed) {
                return Err(SessionError::Protocol("conflicting content-length".to_string()));
            }
            length = Some(parsed);
        }

        Ok(match length {
            Some(0) | None => BodyFraming::Empty,
            Some(n) => BodyFraming::Length(n),
        })
    }

    /// `Upgrade: websocket`, compared case-insensitively
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header_values("upgrade")
            .any(|v| String::from_utf8_lossy(v).trim().eq_ignore_ascii_case("websocket"))
    }

    /// Apply the per-hop rewrite: client IP, forwarding chain and prefix strip
    pub fn rewrite(&mut self, client_ip: IpAddr, local_ip: IpAddr, strip_prefix: &str) {
        let previous: Vec<String> = self
            .header_values("x-forwarded-for")
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("x-forwarded-for"));

        let mut forwarded_for = local_ip.to_string();
        for value in previous {
            forwarded_for.push(',');
            forwarded_for.push_str(&value);
        }

        self.headers
            .push(("X-Real-IP".to_string(), client_ip.to_string().into_bytes()));
        self.headers
            .push(("X-Forwarded-For".to_string(), forwarded_for.into_bytes()));

        if let Some(stripped) = strip_path_prefix(&self.target, strip_prefix) {
            self.target = stripped;
        }
    }

    /// Serialize the head, terminating blank line included
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(self.target.len() + 64 + self.headers.len() * 32);
        out.put_slice(self.method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.target.as_bytes());
        out.put_slice(if self.version == 0 {
            b" HTTP/1.0\r\n"
        } else {
            b" HTTP/1.1\r\n"
        });

        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
    }
}

/// Strip a literal path prefix, keeping a leading `/`
///
/// Returns `None` when `prefix` is empty or does not match.
pub fn strip_path_prefix(target: &str, prefix: &str) -> Option<String> {
    if prefix.is_empty() {
        return None;
    }

    let rest = target.strip_prefix(prefix)?;
    if rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        Some(format!("/{rest}"))
    }
}
