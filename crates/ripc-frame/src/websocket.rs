//! WebSocket framing (RFC 6455) as an outer transport for RIPC.
//!
//! Frame layout:
//! ```text
//! ┌───┬──────┬────────┬───┬─────────┬──────────────────┬──────────┬─────────┐
//! │FIN│ RSV1 │ opcode │ M │ len (7) │ ext len (0/2/8B) │ mask (4B)│ payload │
//! └───┴──────┴────────┴───┴─────────┴──────────────────┴──────────┴─────────┘
//! ```
//! RSV1 marks a per-message compressed payload. Clients mask every frame
//! they send; servers never do.

use std::hash::BuildHasher;

use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::pool::ByteBufferPair;
use crate::protocol::{ControlFrame, HeaderVerdict, ProtocolFunctions, TransportProtocol};
use crate::state::ReadBufferState;
use crate::wire::{self, HEADER_SIZE};

/// Largest possible frame header: 2 + 8 extended length + 4 mask.
pub const MAX_HEADER_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status sent when answering a peer's close.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Frame opcodes.
pub mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const MASK_BIT: u8 = 0x80;

/// Which end of the WebSocket this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

/// Payload carried inside the frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WsMode {
    Rwf,
    Json,
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsFrameHeader {
    pub fin: bool,
    /// RSV1: payload is per-message compressed.
    pub compressed: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    /// Bytes in front of the payload.
    pub header_len: usize,
    pub payload_len: usize,
}

impl WsFrameHeader {
    /// Decode the header at the start of `src`.
    ///
    /// Returns `Ok(None)` until the whole header is available.
    pub fn decode(src: &[u8]) -> Result<Option<Self>> {
        if src.len() < 2 {
            return Ok(None); // Need more data
        }
        let fin = src[0] & FIN_BIT != 0;
        let compressed = src[0] & RSV1_BIT != 0;
        let opcode = src[0] & 0x0F;
        let masked = src[1] & MASK_BIT != 0;

        let (ext_len, payload_len) = match src[1] & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (2, u64::from(wire::read_u16(src, 2)))
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    src[2], src[3], src[4], src[5], src[6], src[7], src[8], src[9],
                ]);
                if len >> 63 != 0 {
                    return Err(FrameError::MalformedHeader(
                        "websocket payload length has its high bit set",
                    ));
                }
                (8, len)
            }
            short => (0, u64::from(short)),
        };

        let header_len = 2 + ext_len + if masked { 4 } else { 0 };
        if src.len() < header_len {
            return Ok(None);
        }
        let mask = masked.then(|| {
            let at = header_len - 4;
            [src[at], src[at + 1], src[at + 2], src[at + 3]]
        });

        if opcode >= opcode::CLOSE && (!fin || payload_len > MAX_CONTROL_PAYLOAD as u64) {
            return Err(FrameError::MalformedHeader(
                "websocket control frame fragmented or oversized",
            ));
        }

        let payload_len = usize::try_from(payload_len).map_err(|_| {
            FrameError::MalformedHeader("websocket payload length exceeds address space")
        })?;

        Ok(Some(Self {
            fin,
            compressed,
            opcode,
            mask,
            header_len,
            payload_len,
        }))
    }

    /// Header plus payload.
    pub fn frame_len(&self) -> usize {
        self.header_len + self.payload_len
    }

    pub fn is_control(&self) -> bool {
        self.opcode >= opcode::CLOSE
    }

    /// Header size for a payload of `payload_len` bytes.
    pub fn header_len_for(payload_len: usize, masked: bool) -> usize {
        let ext = match payload_len {
            0..=125 => 0,
            126..=0xFFFF => 2,
            _ => 8,
        };
        2 + ext + if masked { 4 } else { 0 }
    }

    /// Write a frame header for `payload_len` bytes.
    pub fn encode(
        fin: bool,
        compressed: bool,
        opcode: u8,
        payload_len: usize,
        mask: Option<[u8; 4]>,
        dst: &mut impl BufMut,
    ) {
        let mut first = opcode & 0x0F;
        if fin {
            first |= FIN_BIT;
        }
        if compressed {
            first |= RSV1_BIT;
        }
        dst.put_u8(first);

        let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
        match payload_len {
            0..=125 => dst.put_u8(mask_bit | payload_len as u8),
            126..=0xFFFF => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(payload_len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(payload_len as u64);
            }
        }
        if let Some(key) = mask {
            dst.put_slice(&key);
        }
    }
}

/// XOR `data` with the 4-byte mask key. Applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// WebSocket-wrapped RIPC (binary frames) or JSON (text frames).
#[derive(Debug)]
pub struct WsProtocol {
    mode: WsMode,
    role: Role,
    frame: Option<WsFrameHeader>,
    ripc_length: Option<usize>,
    mask_state: u64,
}

impl WsProtocol {
    pub fn new(mode: WsMode, role: Role) -> Self {
        let seed = std::collections::hash_map::RandomState::new().hash_one(std::process::id());
        Self {
            mode,
            role,
            frame: None,
            ripc_length: None,
            mask_state: seed | 1,
        }
    }

    pub fn mode(&self) -> WsMode {
        self.mode
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn next_mask(&mut self) -> [u8; 4] {
        // xorshift64
        let mut x = self.mask_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.mask_state = x;
        ((x >> 32) as u32).to_be_bytes()
    }

    fn data_opcode(&self) -> u8 {
        match self.mode {
            WsMode::Rwf => opcode::BINARY,
            WsMode::Json => opcode::TEXT,
        }
    }

    fn write_frame(&mut self, fin: bool, opcode: u8, payload: &[u8], dst: &mut BytesMut) {
        let mask = (self.role == Role::Client).then(|| self.next_mask());
        dst.reserve(WsFrameHeader::header_len_for(payload.len(), mask.is_some()) + payload.len());
        WsFrameHeader::encode(fin, false, opcode, payload.len(), mask, dst);
        let at = dst.len();
        dst.put_slice(payload);
        if let Some(key) = mask {
            apply_mask(&mut dst[at..], key);
        }
    }

    fn pending_state(&self, insufficient: bool) -> ReadBufferState {
        match (self.mode, insufficient) {
            (WsMode::Json, false) => ReadBufferState::KnownIncomplete,
            (WsMode::Json, true) => ReadBufferState::KnownInsufficient,
            (WsMode::Rwf, false) => ReadBufferState::UnknownIncomplete,
            (WsMode::Rwf, true) => ReadBufferState::UnknownInsufficient,
        }
    }
}

impl ProtocolFunctions for WsProtocol {
    fn transport(&self) -> TransportProtocol {
        match self.mode {
            WsMode::Rwf => TransportProtocol::WebSocketRwf,
            WsMode::Json => TransportProtocol::WebSocketJson,
        }
    }

    fn read_prepend_transport_header(
        &mut self,
        io: &mut ByteBufferPair,
        start: usize,
    ) -> Result<HeaderVerdict> {
        let received = io.position();
        let limit = io.limit();

        let Some(header) = WsFrameHeader::decode(io.window(start, received - start))? else {
            self.frame = None;
            let state = if start + MAX_HEADER_SIZE <= limit {
                ReadBufferState::UnknownIncomplete
            } else {
                ReadBufferState::UnknownInsufficient
            };
            return Ok(HeaderVerdict::NeedMore(state));
        };

        let payload_start = start + header.header_len;
        let frame_end = start + header.frame_len();
        self.frame = Some(header);
        if frame_end > received {
            return Ok(HeaderVerdict::NeedMore(self.pending_state(frame_end > limit)));
        }

        if let Some(key) = header.mask {
            apply_mask(&mut io.as_mut_slice()[payload_start..frame_end], key);
        }
        let payload = io.window(payload_start, header.payload_len);

        let verdict = match header.opcode {
            opcode::PING => HeaderVerdict::Control(ControlFrame::Ping(payload.to_vec())),
            opcode::PONG => HeaderVerdict::Control(ControlFrame::Pong),
            opcode::CLOSE => {
                let code = (payload.len() >= 2).then(|| wire::read_u16(payload, 0));
                HeaderVerdict::Control(ControlFrame::Close(code))
            }
            opcode::CONTINUATION | opcode::TEXT | opcode::BINARY => HeaderVerdict::Ready,
            _ => return Err(FrameError::MalformedHeader("unknown websocket opcode")),
        };
        Ok(verdict)
    }

    fn set_ripc_length(&mut self, ripc_length: usize) {
        self.ripc_length = Some(ripc_length);
    }

    fn message_length(&self) -> usize {
        let Some(frame) = self.frame else {
            return 0;
        };
        match self.mode {
            WsMode::Rwf => frame.header_len + self.ripc_length.unwrap_or(frame.payload_len),
            WsMode::Json => frame.frame_len(),
        }
    }

    fn additional_header_length(&self) -> usize {
        self.frame.map_or(0, |frame| frame.header_len)
    }

    fn entire_header_length(&self) -> usize {
        match self.mode {
            WsMode::Rwf => self.additional_header_length() + HEADER_SIZE,
            WsMode::Json => self.additional_header_length(),
        }
    }

    fn estimate_header_length(&self) -> usize {
        match self.mode {
            WsMode::Rwf => MAX_HEADER_SIZE + HEADER_SIZE,
            WsMode::Json => MAX_HEADER_SIZE,
        }
    }

    fn is_rwf_protocol(&self) -> bool {
        self.mode == WsMode::Rwf
    }

    fn unset_message_length(&mut self) {
        self.frame = None;
        self.ripc_length = None;
    }

    fn frame_header(&self) -> Option<&WsFrameHeader> {
        self.frame.as_ref()
    }

    fn prepend_transport_header(&mut self, record: &[u8], dst: &mut BytesMut) -> Result<()> {
        let opcode = self.data_opcode();
        self.write_frame(true, opcode, record, dst);
        Ok(())
    }

    fn prepend_fragment_header(
        &mut self,
        piece: &[u8],
        first: bool,
        last: bool,
        dst: &mut BytesMut,
    ) -> Result<()> {
        let opcode = if first {
            self.data_opcode()
        } else {
            opcode::CONTINUATION
        };
        self.write_frame(last, opcode, piece, dst);
        Ok(())
    }

    fn write_additional_message_prefix(&self, dst: &mut BytesMut) {
        if self.mode == WsMode::Json {
            dst.put_u8(b'[');
        }
    }

    fn ping_message(&self) -> &'static [u8] {
        match self.mode {
            WsMode::Rwf => &wire::PING,
            WsMode::Json => br#"[{"Type":"Ping"}]"#,
        }
    }

    fn write_control_reply(&mut self, control: &ControlFrame, dst: &mut BytesMut) {
        match control {
            ControlFrame::Ping(payload) => self.write_frame(true, opcode::PONG, payload, dst),
            ControlFrame::Close(_) => {
                self.write_frame(true, opcode::CLOSE, &CLOSE_GOING_AWAY.to_be_bytes(), dst)
            }
            ControlFrame::Pong => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fin: bool, opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut out = BytesMut::new();
        WsFrameHeader::encode(fin, false, opcode, payload.len(), mask, &mut out);
        let at = out.len();
        out.put_slice(payload);
        if let Some(key) = mask {
            apply_mask(&mut out[at..], key);
        }
        out.to_vec()
    }

    fn io_with(bytes: &[u8], capacity: usize) -> ByteBufferPair {
        let mut io = ByteBufferPair::unpooled(capacity);
        assert!(io.try_append(bytes));
        io
    }

    #[test]
    fn test_header_length_forms() {
        for len in [0usize, 125, 126, 0xFFFF, 0x10000] {
            let mut buf = BytesMut::new();
            WsFrameHeader::encode(true, false, opcode::BINARY, len, None, &mut buf);
            assert_eq!(buf.len(), WsFrameHeader::header_len_for(len, false));
            let header = WsFrameHeader::decode(&buf).unwrap().unwrap();
            assert_eq!(header.payload_len, len);
            assert_eq!(header.header_len, buf.len());
            assert!(header.fin);
        }
    }

    #[test]
    fn test_partial_header() {
        let bytes = frame(true, opcode::BINARY, &[0u8; 300], Some([1, 2, 3, 4]));
        assert!(WsFrameHeader::decode(&bytes[..1]).unwrap().is_none());
        assert!(WsFrameHeader::decode(&bytes[..3]).unwrap().is_none());
        assert!(WsFrameHeader::decode(&bytes[..7]).unwrap().is_none());
        assert!(WsFrameHeader::decode(&bytes[..8]).unwrap().is_some());
    }

    #[test]
    fn test_high_bit_length_rejected() {
        let bytes = [0x82, 127, 0x80, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(
            WsFrameHeader::decode(&bytes),
            Err(FrameError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_fragmented_control_rejected() {
        let bytes = frame(false, opcode::PING, b"", None);
        assert!(WsFrameHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_mask_is_involution() {
        let mut data = b"market data".to_vec();
        apply_mask(&mut data, [9, 8, 7, 6]);
        assert_ne!(&data, b"market data");
        apply_mask(&mut data, [9, 8, 7, 6]);
        assert_eq!(&data, b"market data");
    }

    #[test]
    fn test_read_unmasks_payload_in_place() {
        let bytes = frame(true, opcode::BINARY, &[0, 5, 2, 0xAA, 0xBB], Some([1, 2, 3, 4]));
        let mut io = io_with(&bytes, 64);
        let mut ws = WsProtocol::new(WsMode::Rwf, Role::Server);

        let verdict = ws.read_prepend_transport_header(&mut io, 0).unwrap();
        assert_eq!(verdict, HeaderVerdict::Ready);
        assert_eq!(ws.additional_header_length(), 6);
        assert_eq!(io.window(6, 5), &[0, 5, 2, 0xAA, 0xBB]);
        ws.set_ripc_length(5);
        assert_eq!(ws.message_length(), 11);
        assert_eq!(ws.entire_header_length(), 9);
    }

    #[test]
    fn test_partial_frame_states() {
        let bytes = frame(true, opcode::TEXT, &[b'x'; 40], None);

        let mut json = WsProtocol::new(WsMode::Json, Role::Client);
        let mut io = io_with(&bytes[..10], 64);
        assert_eq!(
            json.read_prepend_transport_header(&mut io, 0).unwrap(),
            HeaderVerdict::NeedMore(ReadBufferState::KnownIncomplete)
        );
        let mut tight = io_with(&bytes[..10], 32);
        assert_eq!(
            json.read_prepend_transport_header(&mut tight, 0).unwrap(),
            HeaderVerdict::NeedMore(ReadBufferState::KnownInsufficient)
        );

        let mut rwf = WsProtocol::new(WsMode::Rwf, Role::Client);
        let mut io = io_with(&bytes[..10], 64);
        assert_eq!(
            rwf.read_prepend_transport_header(&mut io, 0).unwrap(),
            HeaderVerdict::NeedMore(ReadBufferState::UnknownIncomplete)
        );
        let mut io = io_with(&bytes[..1], 64);
        assert_eq!(
            rwf.read_prepend_transport_header(&mut io, 0).unwrap(),
            HeaderVerdict::NeedMore(ReadBufferState::UnknownIncomplete)
        );
    }

    #[test]
    fn test_control_frames() {
        let mut ws = WsProtocol::new(WsMode::Json, Role::Client);

        let mut io = io_with(&frame(true, opcode::PING, b"hb", None), 64);
        assert_eq!(
            ws.read_prepend_transport_header(&mut io, 0).unwrap(),
            HeaderVerdict::Control(ControlFrame::Ping(b"hb".to_vec()))
        );

        let mut io = io_with(&frame(true, opcode::CLOSE, &1000u16.to_be_bytes(), None), 64);
        assert_eq!(
            ws.read_prepend_transport_header(&mut io, 0).unwrap(),
            HeaderVerdict::Control(ControlFrame::Close(Some(1000)))
        );
    }

    #[test]
    fn test_client_frames_are_masked_server_frames_are_not() {
        let mut client = WsProtocol::new(WsMode::Rwf, Role::Client);
        let mut out = BytesMut::new();
        client.prepend_transport_header(&wire::PING, &mut out).unwrap();
        let header = WsFrameHeader::decode(&out).unwrap().unwrap();
        assert!(header.mask.is_some());
        assert_eq!(header.opcode, opcode::BINARY);
        let mut payload = out[header.header_len..].to_vec();
        apply_mask(&mut payload, header.mask.unwrap());
        assert_eq!(payload, wire::PING);

        let mut server = WsProtocol::new(WsMode::Json, Role::Server);
        let mut out = BytesMut::new();
        server.prepend_transport_header(b"{}", &mut out).unwrap();
        let header = WsFrameHeader::decode(&out).unwrap().unwrap();
        assert!(header.mask.is_none());
        assert_eq!(header.opcode, opcode::TEXT);
        assert_eq!(&out[header.header_len..], b"{}");
    }

    #[test]
    fn test_fragment_headers() {
        let mut server = WsProtocol::new(WsMode::Json, Role::Server);
        let mut out = BytesMut::new();
        server.prepend_fragment_header(b"ab", true, false, &mut out).unwrap();
        let first = WsFrameHeader::decode(&out).unwrap().unwrap();
        assert_eq!((first.fin, first.opcode), (false, opcode::TEXT));

        let mut out = BytesMut::new();
        server.prepend_fragment_header(b"cd", false, true, &mut out).unwrap();
        let last = WsFrameHeader::decode(&out).unwrap().unwrap();
        assert_eq!((last.fin, last.opcode), (true, opcode::CONTINUATION));
    }

    #[test]
    fn test_pong_echoes_ping_payload() {
        let mut server = WsProtocol::new(WsMode::Rwf, Role::Server);
        let mut out = BytesMut::new();
        server.write_control_reply(&ControlFrame::Ping(b"abc".to_vec()), &mut out);
        let header = WsFrameHeader::decode(&out).unwrap().unwrap();
        assert_eq!(header.opcode, opcode::PONG);
        assert_eq!(&out[header.header_len..], b"abc");
    }

    #[test]
    fn test_json_prefix_and_ping() {
        let json = WsProtocol::new(WsMode::Json, Role::Client);
        let mut out = BytesMut::new();
        json.write_additional_message_prefix(&mut out);
        assert_eq!(&out[..], b"[");
        assert_eq!(json.ping_message(), br#"[{"Type":"Ping"}]"#);
    }
}
