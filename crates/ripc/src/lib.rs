//! RIPC transport core.
//!
//! RIPC carries length-prefixed records over a reliable byte stream. Large
//! messages are fragmented, small ones may be packed several to a record,
//! and bodies can be compressed with zlib or lz4. The read side is a
//! resumable state machine that copes with arbitrary chunking.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix domain socket streams
//! - [`frame`]: wire format, buffer pool, read state machine, writer
//! - [`channel`]: handshake, version fallback and the `Channel` API (behind `channel` feature)

/// Re-export transport types.
pub mod transport {
    pub use ripc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use ripc_frame::*;
}

/// Re-export channel types (requires `channel` feature).
#[cfg(feature = "channel")]
pub mod channel {
    pub use ripc_channel::*;
}
