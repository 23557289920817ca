//! Byte-stream transports for RIPC channels.
//!
//! RIPC runs over any reliable, ordered byte stream. This crate provides the
//! two used in practice:
//! - TCP (with `TCP_NODELAY` and socket buffer sizing)
//! - Unix domain sockets (local deployments and tests)
//!
//! Everything above this layer reads and writes through [`RipcStream`].

pub mod endpoint;
pub mod error;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod unix;

pub use endpoint::{connect, Endpoint, Listener};
pub use error::{Result, TransportError};
pub use stream::{RipcStream, SocketOptions};
pub use tcp::TcpTransport;

#[cfg(unix)]
pub use unix::UnixTransport;
