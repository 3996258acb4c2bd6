//! Connection plumbing for the broker
//!
//! Everything a session reads from or writes to is a [`BrokerStream`]: plain
//! TCP, TLS-terminated TCP, a sniffed connection with its captured bytes
//! replayed in front, or any of those wrapped in the [`SecureStream`] byte
//! transform. Streams backed by a socket expose a [`HalfCloser`] so one
//! direction can be shut down while the other keeps flowing.

pub mod replay;
pub mod secure;
pub mod stream;

pub use replay::ReplayStream;
pub use secure::SecureStream;
pub use stream::{BoxedStream, BrokerStream, HalfCloser, SplitClose};
