//! Channel lifecycle for RIPC.
//!
//! A channel is one connected byte stream that has completed the RIPC
//! handshake. Clients [`connect`] (falling back to older protocol versions
//! when the server refuses one); servers bind a [`ChannelListener`] and
//! accept. After the handshake both sides exchange length-prefixed records
//! through [`Channel::read`] and [`Channel::write`], with fragmentation,
//! packing, compression and keep-alive pings handled underneath.

pub mod channel;
pub mod config;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod listener;

pub use channel::{Channel, ChannelInfo, ReadEvent};
pub use config::ChannelConfig;
pub use connector::{connect, connect_stream};
pub use error::{ChannelError, Result};
pub use handshake::{
    handshake_client, handshake_server, session_flags, ConnectAck, ConnectReq, Handshake,
    HandshakeConfig, HandshakeMessage, SessionParams, MIN_USER_MSG_SIZE,
};
pub use listener::{accept_stream, ChannelListener};
