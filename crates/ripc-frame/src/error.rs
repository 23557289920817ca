use crate::state::ReadBufferState;

/// Errors raised while framing, reassembling or decompressing RIPC records.
///
/// Everything except [`FrameError::NoBuffers`] leaves the byte stream in an
/// unknown position and must be treated as fatal for the channel.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A record header is inconsistent with the bytes that follow it.
    #[error("malformed record header: {0}")]
    MalformedHeader(&'static str),

    /// A first fragment announced a reassembled length that cannot be represented.
    #[error("fragmented message too large ({size} bytes, max {max})")]
    FragmentTooLarge { size: u64, max: usize },

    /// More fragment data arrived than the first fragment announced.
    #[error("fragment {fragment_id} overflows its announced length of {limit} bytes")]
    FragmentOverflow { fragment_id: u16, limit: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The compressor could not inflate a record.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// The compressor could not deflate a record.
    #[error("compression failed: {0}")]
    Compress(String),

    /// The buffer pool cannot supply the requested capacity.
    #[error("no buffers available ({requested} bytes requested)")]
    NoBuffers { requested: usize },

    /// A caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was invoked in a state where it is not defined.
    #[error("{operation} is not valid in state {state:?}")]
    ContractViolation {
        operation: &'static str,
        state: ReadBufferState,
    },

    /// An I/O error occurred while reading or writing records.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
