//! Stream abstraction and half-close support

use std::io;
use std::net::Shutdown;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Shut down one direction of a connection without closing it
pub trait SplitClose {
    /// Stop receiving; pending and future reads see end of stream
    fn close_read(&self) -> io::Result<()>;

    /// Stop sending; the peer sees end of stream
    fn close_write(&self) -> io::Result<()>;
}

/// Half-close handle for a TCP connection
///
/// Holds a duplicate of the socket descriptor, so it stays valid after the
/// stream it came from is split into read and write halves.
#[derive(Debug)]
pub struct HalfCloser {
    socket: socket2::Socket,
}

impl HalfCloser {
    pub fn from_tcp(stream: &TcpStream) -> io::Result<Self> {
        let socket = socket2::SockRef::from(stream).try_clone()?;
        Ok(Self { socket })
    }
}

impl SplitClose for HalfCloser {
    fn close_read(&self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Read)
    }

    fn close_write(&self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Write)
    }
}

impl SplitClose for TcpStream {
    fn close_read(&self) -> io::Result<()> {
        socket2::SockRef::from(self).shutdown(Shutdown::Read)
    }

    fn close_write(&self) -> io::Result<()> {
        socket2::SockRef::from(self).shutdown(Shutdown::Write)
    }
}

impl<T: SplitClose> SplitClose for Option<T> {
    fn close_read(&self) -> io::Result<()> {
        match self {
            Some(closer) => closer.close_read(),
            None => Err(unsupported()),
        }
    }

    fn close_write(&self) -> io::Result<()> {
        match self {
            Some(closer) => closer.close_write(),
            None => Err(unsupported()),
        }
    }
}

fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "not a half-closable connection",
    )
}

/// A bidirectional byte stream a session can relay
pub trait BrokerStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Half-close handle for the underlying socket, if there is one
    fn half_closer(&self) -> Option<HalfCloser>;
}

pub type BoxedStream = Box<dyn BrokerStream>;

impl BrokerStream for TcpStream {
    fn half_closer(&self) -> Option<HalfCloser> {
        match HalfCloser::from_tcp(self) {
            Ok(closer) => Some(closer),
            Err(e) => {
                debug!("Failed to duplicate socket for half-close: {}", e);
                None
            }
        }
    }
}

impl<S: BrokerStream> BrokerStream for tokio_rustls::server::TlsStream<S> {
    fn half_closer(&self) -> Option<HalfCloser> {
        self.get_ref().0.half_closer()
    }
}

impl BrokerStream for tokio::io::DuplexStream {
    fn half_closer(&self) -> Option<HalfCloser> {
        None
    }
}

impl<S: BrokerStream + ?Sized> BrokerStream for Box<S> {
    fn half_closer(&self) -> Option<HalfCloser> {
        (**self).half_closer()
    }
}
