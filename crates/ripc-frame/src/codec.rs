use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::wire::{
    ext_flags, flags, ProtocolVersion, CONTINUATION_HEADER_SIZE, DEFAULT_MAX_USER_MSG_SIZE,
    FIRST_FRAGMENT_HEADER_SIZE, HEADER_SIZE, MAX_RECORD_SIZE, PACKED_ENTRY_HEADER_SIZE, PING,
};
use crate::websocket::MAX_HEADER_SIZE;

/// Default read buffer: one maximum record plus the largest outer frame header.
pub const DEFAULT_READ_BUFFER_CAPACITY: usize = MAX_RECORD_SIZE + MAX_HEADER_SIZE;

/// Extended header carried by a fragmented record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentHeader {
    /// Opens a reassembly of `total_len` bytes.
    First { fragment_id: u16, total_len: u32 },
    /// Appends to an open reassembly.
    Continuation { fragment_id: u16 },
}

impl FragmentHeader {
    pub fn fragment_id(&self) -> u16 {
        match *self {
            Self::First { fragment_id, .. } | Self::Continuation { fragment_id } => fragment_id,
        }
    }

    /// Bytes this header adds after the 3-byte record header.
    pub fn encoded_len(&self, version: ProtocolVersion) -> usize {
        let fixed = match self {
            Self::First { .. } => FIRST_FRAGMENT_HEADER_SIZE,
            Self::Continuation { .. } => CONTINUATION_HEADER_SIZE,
        };
        fixed - HEADER_SIZE + version.fragment_id_width()
    }
}

/// Encode one record.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬───────────────────────────┬──────────────┐
/// │ Length (2B)  │ Flags     │ Fragment header (optional) │ Body         │
/// │ big-endian,  │ (1B)      │ ext flags + [total] + id   │              │
/// │ incl. header │           │                            │              │
/// └──────────────┴───────────┴───────────────────────────┴──────────────┘
/// ```
/// `HAS_OPTIONAL_FLAGS` is set automatically when `fragment` is present.
pub fn encode_record(
    record_flags: u8,
    fragment: Option<FragmentHeader>,
    version: ProtocolVersion,
    body: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    let extra = fragment.map_or(0, |f| f.encoded_len(version));
    let total = HEADER_SIZE + extra + body.len();
    if total > MAX_RECORD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: total,
            max: MAX_RECORD_SIZE,
        });
    }
    if version.fragment_id_width() == 1 {
        if let Some(f) = fragment.filter(|f| f.fragment_id() > u16::from(u8::MAX)) {
            return Err(FrameError::InvalidArgument(format!(
                "fragment id {} does not fit version {version}",
                f.fragment_id()
            )));
        }
    }

    dst.reserve(total);
    dst.put_u16(total as u16);
    match fragment {
        None => dst.put_u8(record_flags & !flags::HAS_OPTIONAL_FLAGS),
        Some(header) => {
            dst.put_u8(record_flags | flags::HAS_OPTIONAL_FLAGS);
            match header {
                FragmentHeader::First {
                    fragment_id,
                    total_len,
                } => {
                    dst.put_u8(ext_flags::FRAGMENT_HEADER);
                    dst.put_u32(total_len);
                    put_fragment_id(fragment_id, version, dst);
                }
                FragmentHeader::Continuation { fragment_id } => {
                    dst.put_u8(ext_flags::FRAGMENT);
                    put_fragment_id(fragment_id, version, dst);
                }
            }
        }
    }
    dst.put_slice(body);
    Ok(())
}

/// A plain data record.
pub fn encode_plain(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    encode_record(flags::DATA, None, ProtocolVersion::default(), payload, dst)
}

/// The bare heartbeat record.
pub fn encode_ping(dst: &mut BytesMut) {
    dst.put_slice(&PING);
}

/// Body of a packed record: `u16 length | payload` per entry.
pub fn pack_entries<'a>(entries: impl IntoIterator<Item = &'a [u8]>, dst: &mut BytesMut) -> Result<()> {
    for entry in entries {
        let len = u16::try_from(entry.len()).map_err(|_| FrameError::PayloadTooLarge {
            size: entry.len(),
            max: u16::MAX as usize,
        })?;
        dst.reserve(PACKED_ENTRY_HEADER_SIZE + entry.len());
        dst.put_u16(len);
        dst.put_slice(entry);
    }
    Ok(())
}

/// A packed record holding `entries` in order.
pub fn encode_packed(entries: &[&[u8]], dst: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::new();
    pack_entries(entries.iter().copied(), &mut body)?;
    encode_record(
        flags::DATA | flags::PACKING,
        None,
        ProtocolVersion::default(),
        &body,
        dst,
    )
}

fn put_fragment_id(fragment_id: u16, version: ProtocolVersion, dst: &mut BytesMut) {
    if version.fragment_id_width() == 2 {
        dst.put_u16(fragment_id);
    } else {
        dst.put_u8(fragment_id as u8);
    }
}

/// Configuration for the record reader and writer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest application message carried by one record. Default: 6 KiB.
    pub max_user_msg_size: usize,
    /// Initial read buffer capacity. A record that outgrows it swaps in a
    /// larger buffer, up to the largest fragment plus outer framing.
    pub read_buffer_capacity: usize,
    /// Largest total a first fragment may announce. Default: `i32::MAX`.
    pub max_reassembly_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl FrameConfig {
    /// Largest record body before fragmentation kicks in.
    pub fn max_fragment_size(&self) -> usize {
        self.max_user_msg_size
    }

    pub fn with_max_user_msg_size(mut self, size: usize) -> Self {
        self.max_user_msg_size = size;
        self
    }

    pub fn with_read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.read_buffer_capacity = capacity;
        self
    }

    pub fn with_max_reassembly_size(mut self, size: usize) -> Self {
        self.max_reassembly_size = size;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_user_msg_size: DEFAULT_MAX_USER_MSG_SIZE,
            read_buffer_capacity: DEFAULT_READ_BUFFER_CAPACITY,
            max_reassembly_size: i32::MAX as usize,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_record_layout() {
        let mut buf = BytesMut::new();
        encode_plain(b"hello", &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x08, flags::DATA, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_ping_record() {
        let mut buf = BytesMut::new();
        encode_ping(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0x03, 0x02]);
    }

    #[test]
    fn test_first_fragment_v14() {
        let mut buf = BytesMut::new();
        let header = FragmentHeader::First {
            fragment_id: 0x0102,
            total_len: 1000,
        };
        encode_record(flags::DATA, Some(header), ProtocolVersion::V14, b"ab", &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x00, 0x0C, 0x03, 0x01, 0x00, 0x00, 0x03, 0xE8, 0x01, 0x02, b'a', b'b']
        );
    }

    #[test]
    fn test_continuation_v12_uses_one_byte_id() {
        let mut buf = BytesMut::new();
        let header = FragmentHeader::Continuation { fragment_id: 7 };
        encode_record(flags::DATA, Some(header), ProtocolVersion::V12, b"xyz", &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x08, 0x03, 0x02, 0x07, b'x', b'y', b'z']);
    }

    #[test]
    fn test_wide_fragment_id_rejected_for_v12() {
        let mut buf = BytesMut::new();
        let header = FragmentHeader::Continuation { fragment_id: 300 };
        let err = encode_record(flags::DATA, Some(header), ProtocolVersion::V12, b"", &mut buf)
            .unwrap_err();
        assert!(matches!(err, FrameError::InvalidArgument(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_packed_record() {
        let mut buf = BytesMut::new();
        encode_packed(&[b"ab", b"", b"c"], &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x00, 0x0C, 0x12, 0x00, 0x02, b'a', b'b', 0x00, 0x00, 0x00, 0x01, b'c']
        );
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut buf = BytesMut::new();
        let body = vec![0u8; MAX_RECORD_SIZE];
        let err = encode_plain(&body, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_frame_config_builders() {
        let cfg = FrameConfig::default()
            .with_max_user_msg_size(1024)
            .with_read_buffer_capacity(4096)
            .with_read_timeout(Some(std::time::Duration::from_millis(5)));
        assert_eq!(cfg.max_fragment_size(), 1024);
        assert_eq!(cfg.read_buffer_capacity, 4096);
        assert_eq!(cfg.max_reassembly_size, i32::MAX as usize);
        assert!(cfg.write_timeout.is_none());
    }
}
