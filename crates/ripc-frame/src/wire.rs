//! RIPC record layout.
//!
//! Every record starts with a 3-byte header:
//! ```text
//! ┌──────────────┬───────────┬──────────────────────────────────────────────┐
//! │ Length (2B)  │ Flags     │ Body                                          │
//! │ big-endian,  │ (1B)      │ (Length - 3 bytes)                            │
//! │ incl. header │           │                                               │
//! └──────────────┴───────────┴──────────────────────────────────────────────┘
//! ```
//! With `HAS_OPTIONAL_FLAGS` the body begins with an extended-flags byte and
//! either a first-fragment header (`u32` total length + fragment id) or a
//! continuation header (fragment id only). With `PACKING` the body is a run
//! of `u16 length | payload` entries.

/// Record header: length (2) + flags (1).
pub const HEADER_SIZE: usize = 3;

/// Smallest read buffer the state machine accepts.
pub const MIN_BUFFER_CAPACITY: usize = 32;

/// Length prefix of each packed entry.
pub const PACKED_ENTRY_HEADER_SIZE: usize = 2;

/// Largest record the 16-bit length field can describe.
pub const MAX_RECORD_SIZE: usize = u16::MAX as usize;

/// Default maximum user message size negotiated by the handshake.
pub const DEFAULT_MAX_USER_MSG_SIZE: usize = 6 * 1024;

/// Flag bits of the header's third byte.
pub mod flags {
    /// An extended-flags byte follows the header.
    pub const HAS_OPTIONAL_FLAGS: u8 = 0x01;
    /// The record carries application data.
    pub const DATA: u8 = 0x02;
    /// The body is compressed.
    pub const COMPRESSION: u8 = 0x04;
    /// First half of a compressed body split across two records.
    pub const COMP_FRAGMENT: u8 = 0x08;
    /// The body holds several length-prefixed messages.
    pub const PACKING: u8 = 0x10;
}

/// Bits of the extended-flags byte.
pub mod ext_flags {
    /// First fragment: total length and fragment id follow.
    pub const FRAGMENT_HEADER: u8 = 0x01;
    /// Continuation fragment: fragment id follows.
    pub const FRAGMENT: u8 = 0x02;
}

/// Byte offsets relative to the record start.
pub mod offsets {
    pub const MSG_FLAG: usize = 2;
    pub const EXTENDED_FLAGS: usize = 3;
    pub const FRAGMENTED_MSG_LENGTH: usize = 4;
    pub const FRAGMENT_HEADER_FRAGMENT_ID: usize = 8;
    pub const FRAGMENT_ID: usize = 4;
    pub const PACKED_MSG_DATA: usize = 2;
}

/// First-fragment header size without the fragment id.
pub const FIRST_FRAGMENT_HEADER_SIZE: usize = 8;

/// Continuation header size without the fragment id.
pub const CONTINUATION_HEADER_SIZE: usize = 4;

/// The bare record used as a heartbeat.
pub const PING: [u8; 3] = [0x00, 0x03, flags::DATA];

/// Decoded fixed part of a record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipcHeader {
    /// Total record length including the header.
    pub length: usize,
    pub flags: u8,
}

impl RipcHeader {
    /// Decode the header at the start of `src`.
    ///
    /// Returns `None` when fewer than [`HEADER_SIZE`] bytes are available.
    pub fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: usize::from(read_u16(src, 0)),
            flags: src[offsets::MSG_FLAG],
        })
    }

    /// A record that carries nothing but the header.
    pub fn is_ping(&self) -> bool {
        self.length == HEADER_SIZE
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Negotiated protocol version, fixed for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
    /// Version 12: one-byte fragment ids.
    pub const V12: Self = Self(12);
    /// Version 13: two-byte fragment ids.
    pub const V13: Self = Self(13);
    /// Version 14: current.
    pub const V14: Self = Self(14);

    /// Versions a client offers, newest first.
    pub const SUPPORTED: [Self; 3] = [Self::V14, Self::V13, Self::V12];

    pub const fn new(ripc: u32) -> Self {
        Self(ripc)
    }

    pub const fn ripc(self) -> u32 {
        self.0
    }

    /// Width in bytes of a fragment id on the wire.
    pub const fn fragment_id_width(self) -> usize {
        if self.0 >= 13 {
            2
        } else {
            1
        }
    }

    /// Largest fragment id representable at this version.
    pub const fn max_fragment_id(self) -> u16 {
        if self.0 >= 13 {
            u16::MAX
        } else {
            u8::MAX as u16
        }
    }

    pub fn is_supported(self) -> bool {
        Self::SUPPORTED.contains(&self)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V14
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RIPC{}", self.0)
    }
}

pub(crate) fn read_u16(src: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([src[at], src[at + 1]])
}

pub(crate) fn read_u32(src: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

/// Read a fragment id of the given width.
pub(crate) fn read_fragment_id(src: &[u8], at: usize, width: usize) -> u16 {
    if width == 2 {
        read_u16(src, at)
    } else {
        u16::from(src[at])
    }
}
