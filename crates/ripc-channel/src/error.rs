use std::time::Duration;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] ripc_transport::TransportError),

    /// Frame-level error. Protocol violations here leave the channel unusable.
    #[error("frame error: {0}")]
    Frame(#[from] ripc_frame::FrameError),

    /// The handshake exchange was malformed or cut short.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server answered the connection request with a NAK.
    #[error("connection rejected by peer: {0}")]
    Rejected(String),

    /// The peer asked for a protocol version this side does not speak.
    #[error("unsupported protocol version {0}")]
    VersionUnsupported(u32),

    /// Another thread is already reading from this channel.
    #[error("another read is in progress on this channel")]
    ReadInProgress,

    /// The channel was closed locally or by the peer.
    #[error("channel closed")]
    Closed,

    /// A handshake step did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ChannelError {
    /// Whether the failure leaves the channel unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ReadInProgress | Self::Timeout(_))
            && !matches!(self, Self::Frame(ripc_frame::FrameError::NoBuffers { .. }))
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
