//! Secure-mode byte transform
//!
//! Every byte crossing the wrapper is bitwise inverted, in both directions.
//! The transform is its own inverse and keeps no state between calls, so
//! partial reads and writes need no bookkeeping.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::stream::{BrokerStream, HalfCloser};

/// Wraps a stream and inverts every byte read from or written to it
#[derive(Debug)]
pub struct SecureStream<S> {
    inner: S,
    scratch: Vec<u8>,
}

impl<S> SecureStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Invert every byte in place
pub fn transform(bytes: &mut [u8]) {
    for b in bytes {
        *b = !*b;
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SecureStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                transform(&mut buf.filled_mut()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SecureStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.scratch.clear();
        this.scratch.extend_from_slice(buf);
        transform(&mut this.scratch);

        Pin::new(&mut this.inner).poll_write(cx, &this.scratch)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: BrokerStream> BrokerStream for SecureStream<S> {
    fn half_closer(&self) -> Option<HalfCloser> {
        self.inner.half_closer()
    }
}
