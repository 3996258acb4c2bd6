//! Raw byte pumps

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PUMP_BUFFER: usize = 16 * 1024;

/// Copy `reader` to `writer` until end of stream or an error
///
/// The byte count is returned even when the copy ends in an error.
pub async fn pump<R, W>(reader: &mut R, writer: &mut W) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            return (total, Err(e));
        }
        total += n as u64;
    }

    (total, writer.flush().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_counts_bytes() {
        let data = vec![42u8; 100_000];
        let mut reader = &data[..];
        let mut out = Vec::new();

        let (n, result) = pump(&mut reader, &mut out).await;
        assert!(result.is_ok());
        assert_eq!(n, 100_000);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_pump_reports_write_error() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let mut writer = a;
        let mut reader = &b"some bytes"[..];

        let (n, result) = pump(&mut reader, &mut writer).await;
        assert_eq!(n, 0);
        assert!(result.is_err());
    }
}
