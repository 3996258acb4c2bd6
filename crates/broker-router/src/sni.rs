//! TLS SNI sniffing
//!
//! Reads TLS records from a fresh connection until the complete ClientHello
//! is buffered, then extracts the Server Name Indication. The handshake is
//! neither completed nor answered: the captured bytes are replayed to the
//! real TLS endpoint afterwards.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Largest TLS record payload accepted (2^14 plus expansion allowance)
const MAX_RECORD_LEN: usize = 16384 + 2048;

/// Largest ClientHello accepted while sniffing
pub const MAX_CLIENT_HELLO_LEN: usize = 16 * 1024;

/// SNI sniffing errors
#[derive(Debug, Error)]
pub enum SniError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a TLS handshake record (content type {0:#04x})")]
    NotHandshake(u8),

    #[error("Unexpected handshake message type {0:#04x}, expected ClientHello")]
    UnexpectedHandshake(u8),

    #[error("Invalid TLS record length: {0}")]
    InvalidRecordLength(usize),

    #[error("ClientHello too large: {0} bytes")]
    ClientHelloTooLarge(usize),

    #[error("Connection closed before the ClientHello was complete")]
    Truncated,

    #[error("SNI extraction failed")]
    SniExtractionFailed,

    #[error("ClientHello has no server_name extension")]
    NoServerName,

    #[error("Invalid SNI hostname: {0}")]
    InvalidSni(String),
}

/// Result of sniffing a ClientHello off a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSniff {
    /// SNI hostname, if the client sent one
    pub server_name: Option<String>,
    /// Number of TLS record bytes consumed
    pub record_bytes: usize,
}

/// Read TLS records from `reader` into `buffer` until the ClientHello is complete.
///
/// The ClientHello may span several records. `buffer` must be empty on entry
/// and keeps every byte read, for replay.
pub async fn sniff_client_hello<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<ClientHelloSniff, SniError>
where
    R: AsyncRead + Unpin,
{
    let mut handshake = Vec::new();
    let mut offset = 0;

    loop {
        fill_to(reader, buffer, offset + RECORD_HEADER_LEN).await?;

        let content_type = buffer[offset];
        if content_type != CONTENT_TYPE_HANDSHAKE {
            return Err(SniError::NotHandshake(content_type));
        }
        let record_len = u16::from_be_bytes([buffer[offset + 3], buffer[offset + 4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return Err(SniError::InvalidRecordLength(record_len));
        }

        let payload_start = offset + RECORD_HEADER_LEN;
        fill_to(reader, buffer, payload_start + record_len).await?;
        handshake.extend_from_slice(&buffer[payload_start..payload_start + record_len]);
        offset = payload_start + record_len;

        if handshake.len() < HANDSHAKE_HEADER_LEN {
            continue;
        }
        if handshake[0] != HANDSHAKE_CLIENT_HELLO {
            return Err(SniError::UnexpectedHandshake(handshake[0]));
        }

        let message_len =
            u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
        if message_len > MAX_CLIENT_HELLO_LEN {
            return Err(SniError::ClientHelloTooLarge(message_len));
        }

        let message_end = HANDSHAKE_HEADER_LEN + message_len;
        if handshake.len() >= message_end {
            let server_name = parse_client_hello(&handshake[HANDSHAKE_HEADER_LEN..message_end])?;
            trace!(
                "Sniffed ClientHello ({} record bytes), SNI {:?}",
                offset,
                server_name
            );
            return Ok(ClientHelloSniff {
                server_name,
                record_bytes: offset,
            });
        }
    }
}

async fn fill_to<R>(reader: &mut R, buffer: &mut BytesMut, len: usize) -> Result<(), SniError>
where
    R: AsyncRead + Unpin,
{
    while buffer.len() < len {
        buffer.reserve(len - buffer.len());
        if reader.read_buf(buffer).await? == 0 {
            return Err(SniError::Truncated);
        }
    }
    Ok(())
}

/// Extract SNI from a single buffered TLS record holding a ClientHello
pub fn extract_sni(client_hello: &[u8]) -> Result<String, SniError> {
    if client_hello.len() < RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN {
        return Err(SniError::SniExtractionFailed);
    }
    if client_hello[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotHandshake(client_hello[0]));
    }

    let handshake = &client_hello[RECORD_HEADER_LEN..];
    if handshake[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::UnexpectedHandshake(handshake[0]));
    }

    parse_client_hello(&handshake[HANDSHAKE_HEADER_LEN..])?.ok_or(SniError::NoServerName)
}

/// Parse a ClientHello body (after the handshake header) for the SNI hostname
fn parse_client_hello(body: &[u8]) -> Result<Option<String>, SniError> {
    // version (2) + random (32)
    let mut offset = 34;

    // session id
    let session_id_len = *body.get(offset).ok_or(SniError::SniExtractionFailed)? as usize;
    offset += 1 + session_id_len;

    // cipher suites
    let cipher_suites_len = read_u16(body, offset)? as usize;
    offset += 2 + cipher_suites_len;

    // compression methods
    let compression_len = *body.get(offset).ok_or(SniError::SniExtractionFailed)? as usize;
    offset += 1 + compression_len;

    if offset == body.len() {
        // no extensions at all
        return Ok(None);
    }

    let extensions_len = read_u16(body, offset)? as usize;
    offset += 2;

    let extensions_end = offset + extensions_len;
    if extensions_end > body.len() {
        return Err(SniError::SniExtractionFailed);
    }

    while offset + 4 <= extensions_end {
        let ext_type = read_u16(body, offset)?;
        let ext_len = read_u16(body, offset + 2)? as usize;
        offset += 4;

        if offset + ext_len > extensions_end {
            return Err(SniError::SniExtractionFailed);
        }

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_sni_extension(&body[offset..offset + ext_len]).map(Some);
        }

        offset += ext_len;
    }

    Ok(None)
}

/// Parse the server_name extension data
fn parse_sni_extension(data: &[u8]) -> Result<String, SniError> {
    if data.len() < 5 {
        return Err(SniError::SniExtractionFailed);
    }

    // Skip server_name_list length (2 bytes)
    let mut offset = 2;

    if data[offset] != NAME_TYPE_HOST_NAME {
        return Err(SniError::InvalidSni("Invalid name type".to_string()));
    }
    offset += 1;

    let name_len = read_u16(data, offset)? as usize;
    offset += 2;

    if offset + name_len > data.len() {
        return Err(SniError::SniExtractionFailed);
    }

    let hostname = String::from_utf8(data[offset..offset + name_len].to_vec())
        .map_err(|_| SniError::InvalidSni("Invalid UTF-8 in hostname".to_string()))?;

    if hostname.is_empty() {
        return Err(SniError::InvalidSni("Empty hostname".to_string()));
    }

    Ok(hostname)
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, SniError> {
    match data.get(offset..offset + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(SniError::SniExtractionFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ClientHello handshake message (without record header) for `hostname`
    fn client_hello_message(hostname: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // TLS 1.2
        body.extend_from_slice(&[0x00; 32]); // random
        body.push(0x00); // session id
        body.extend_from_slice(&[0x00, 0x04, 0x00, 0x2f, 0x00, 0x35]); // cipher suites
        body.extend_from_slice(&[0x01, 0x00]); // compression

        let mut extensions = Vec::new();
        // an unrelated extension first (supported_groups)
        extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x1d]);
        if let Some(name) = hostname {
            let name = name.as_bytes();
            let list_len = name.len() + 3;
            extensions.extend_from_slice(&[0x00, 0x00]);
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(NAME_TYPE_HOST_NAME);
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut message = vec![HANDSHAKE_CLIENT_HELLO];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body);
        message
    }

    fn records(message: &[u8], fragment: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in message.chunks(fragment) {
            out.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x01]);
            out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            out.extend_from_slice(chunk);
        }
        out
    }

    #[test]
    fn test_sni_extraction() {
        let hello = records(&client_hello_message(Some("example.test")), 16384);
        assert_eq!(extract_sni(&hello).unwrap(), "example.test");
    }

    #[test]
    fn test_sni_extraction_not_found() {
        let hello = records(&client_hello_message(None), 16384);
        assert!(matches!(extract_sni(&hello), Err(SniError::NoServerName)));
    }

    #[test]
    fn test_sni_extraction_malformed() {
        let client_hello = vec![0x16, 0x03, 0x01];
        assert!(extract_sni(&client_hello).is_err());

        let mut hello = records(&client_hello_message(Some("example.test")), 16384);
        hello.truncate(60);
        assert!(extract_sni(&hello).is_err());
    }

    #[tokio::test]
    async fn test_sniff_keeps_all_record_bytes() {
        let mut wire = records(&client_hello_message(Some("a.example.com")), 16384);
        let hello_len = wire.len();
        wire.extend_from_slice(b"trailing application bytes");

        let mut reader = &wire[..];
        let mut buffer = BytesMut::new();
        let sniff = sniff_client_hello(&mut reader, &mut buffer).await.unwrap();

        assert_eq!(sniff.server_name.as_deref(), Some("a.example.com"));
        assert_eq!(sniff.record_bytes, hello_len);
        assert!(buffer.len() >= hello_len);
        assert_eq!(&buffer[..], &wire[..buffer.len()]);
    }

    #[tokio::test]
    async fn test_sniff_fragmented_client_hello() {
        let wire = records(&client_hello_message(Some("fragmented.example.com")), 7);

        let mut reader = &wire[..];
        let mut buffer = BytesMut::new();
        let sniff = sniff_client_hello(&mut reader, &mut buffer).await.unwrap();

        assert_eq!(sniff.server_name.as_deref(), Some("fragmented.example.com"));
        assert_eq!(&buffer[..], &wire[..]);
    }

    #[tokio::test]
    async fn test_sniff_without_sni() {
        let wire = records(&client_hello_message(None), 16384);

        let mut reader = &wire[..];
        let mut buffer = BytesMut::new();
        let sniff = sniff_client_hello(&mut reader, &mut buffer).await.unwrap();
        assert_eq!(sniff.server_name, None);
    }

    #[tokio::test]
    async fn test_sniff_rejects_plain_http() {
        let mut reader = &b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n"[..];
        let mut buffer = BytesMut::new();
        let result = sniff_client_hello(&mut reader, &mut buffer).await;
        assert!(matches!(result, Err(SniError::NotHandshake(b'G'))));
    }

    #[tokio::test]
    async fn test_sniff_truncated() {
        let wire = records(&client_hello_message(Some("a.example.com")), 16384);

        let mut reader = &wire[..wire.len() - 10];
        let mut buffer = BytesMut::new();
        let result = sniff_client_hello(&mut reader, &mut buffer).await;
        assert!(matches!(result, Err(SniError::Truncated)));
    }
}
