//! Outer transport framing.
//!
//! The read machine never looks at WebSocket (or any other) framing
//! directly: it asks a [`ProtocolFunctions`] implementation to strip the
//! outer header of the record at the current start position and to report
//! lengths. Adding another outer transport means adding an implementation
//! here, not touching the machine.

use bytes::{BufMut, BytesMut};

use crate::error::Result;
use crate::pool::ByteBufferPair;
use crate::state::ReadBufferState;
use crate::websocket::{Role, WsFrameHeader, WsMode, WsProtocol};
use crate::wire::{self, HEADER_SIZE};

/// Which outer framing a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportProtocol {
    /// RIPC records directly on the byte stream.
    #[default]
    Ripc,
    /// One RIPC record per binary WebSocket frame.
    WebSocketRwf,
    /// JSON text in WebSocket frames, no RIPC header.
    WebSocketJson,
}

impl TransportProtocol {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ripc => "ripc",
            Self::WebSocketRwf => "ws-rwf",
            Self::WebSocketJson => "ws-json",
        }
    }
}

impl std::str::FromStr for TransportProtocol {
    type Err = crate::error::FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ripc" => Ok(Self::Ripc),
            "ws-rwf" | "rwf" => Ok(Self::WebSocketRwf),
            "ws-json" | "json" => Ok(Self::WebSocketJson),
            other => Err(crate::error::FrameError::InvalidArgument(format!(
                "unknown transport protocol {other:?}"
            ))),
        }
    }
}

/// A control frame seen in the outer framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// The peer pinged; the payload must be echoed in a pong.
    Ping(Vec<u8>),
    Pong,
    /// The peer is closing, with its status code if it sent one.
    Close(Option<u16>),
}

/// Result of stripping the outer header at the current record start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderVerdict {
    /// The outer frame is complete; its payload starts
    /// `additional_header_length()` bytes after the record start.
    Ready,
    /// Not enough bytes yet; the machine moves to the given state.
    NeedMore(ReadBufferState),
    /// A control frame occupies the current position.
    Control(ControlFrame),
}

/// Transport-header capability used by the read machine and the writer.
pub trait ProtocolFunctions: Send {
    fn transport(&self) -> TransportProtocol;

    /// Strip the outer header of the record starting at `start` in `io`.
    ///
    /// `io.position()` is the end of received bytes and `io.limit()` the
    /// end of usable space. May unmask payload bytes in place.
    fn read_prepend_transport_header(
        &mut self,
        io: &mut ByteBufferPair,
        start: usize,
    ) -> Result<HeaderVerdict>;

    /// Record the RIPC length decoded from the inner header.
    fn set_ripc_length(&mut self, ripc_length: usize);

    /// Total on-wire length of the current record including outer framing.
    fn message_length(&self) -> usize;

    /// Outer-framing bytes in front of the RIPC header.
    fn additional_header_length(&self) -> usize;

    /// Everything in front of the payload: outer framing plus RIPC header.
    fn entire_header_length(&self) -> usize;

    /// Worst-case header overhead, for sizing outbound buffers.
    fn estimate_header_length(&self) -> usize;

    /// Whether records carry RIPC headers (false for JSON).
    fn is_rwf_protocol(&self) -> bool;

    /// Forget the current record's lengths.
    fn unset_message_length(&mut self);

    /// Header of the current outer frame, if the transport has one.
    fn frame_header(&self) -> Option<&WsFrameHeader> {
        None
    }

    /// Frame one complete outbound record.
    fn prepend_transport_header(&mut self, record: &[u8], dst: &mut BytesMut) -> Result<()>;

    /// Frame one piece of an outbound message split across frames.
    fn prepend_fragment_header(
        &mut self,
        piece: &[u8],
        _first: bool,
        _last: bool,
        dst: &mut BytesMut,
    ) -> Result<()> {
        self.prepend_transport_header(piece, dst)
    }

    /// Bytes that open a packed outbound buffer.
    fn write_additional_message_prefix(&self, _dst: &mut BytesMut) {}

    /// The heartbeat record for this transport, unframed.
    fn ping_message(&self) -> &'static [u8];

    /// Frame the answer owed for a received control frame.
    fn write_control_reply(&mut self, _control: &ControlFrame, _dst: &mut BytesMut) {}
}

/// Build the protocol functions for a transport.
pub fn protocol_for(transport: TransportProtocol, role: Role) -> Box<dyn ProtocolFunctions> {
    match transport {
        TransportProtocol::Ripc => Box::new(RipcProtocol::new()),
        TransportProtocol::WebSocketRwf => Box::new(WsProtocol::new(WsMode::Rwf, role)),
        TransportProtocol::WebSocketJson => Box::new(WsProtocol::new(WsMode::Json, role)),
    }
}

/// Raw RIPC: no outer framing.
#[derive(Debug, Default)]
pub struct RipcProtocol {
    ripc_length: Option<usize>,
}

impl RipcProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProtocolFunctions for RipcProtocol {
    fn transport(&self) -> TransportProtocol {
        TransportProtocol::Ripc
    }

    fn read_prepend_transport_header(
        &mut self,
        _io: &mut ByteBufferPair,
        _start: usize,
    ) -> Result<HeaderVerdict> {
        Ok(HeaderVerdict::Ready)
    }

    fn set_ripc_length(&mut self, ripc_length: usize) {
        self.ripc_length = Some(ripc_length);
    }

    fn message_length(&self) -> usize {
        self.ripc_length.unwrap_or(0)
    }

    fn additional_header_length(&self) -> usize {
        0
    }

    fn entire_header_length(&self) -> usize {
        HEADER_SIZE
    }

    fn estimate_header_length(&self) -> usize {
        HEADER_SIZE
    }

    fn is_rwf_protocol(&self) -> bool {
        true
    }

    fn unset_message_length(&mut self) {
        self.ripc_length = None;
    }

    fn prepend_transport_header(&mut self, record: &[u8], dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(record);
        Ok(())
    }

    fn ping_message(&self) -> &'static [u8] {
        &wire::PING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ripc_lengths() {
        let mut ripc = RipcProtocol::new();
        let mut io = ByteBufferPair::unpooled(32);
        assert_eq!(
            ripc.read_prepend_transport_header(&mut io, 0).unwrap(),
            HeaderVerdict::Ready
        );
        ripc.set_ripc_length(20);
        assert_eq!(ripc.message_length(), 20);
        assert_eq!(ripc.entire_header_length(), 3);
        ripc.unset_message_length();
        assert_eq!(ripc.message_length(), 0);
    }

    #[test]
    fn test_ripc_framing_is_identity() {
        let mut ripc = RipcProtocol::new();
        let mut dst = BytesMut::new();
        ripc.prepend_transport_header(&[0, 4, 2, 9], &mut dst).unwrap();
        assert_eq!(&dst[..], &[0, 4, 2, 9]);
        assert_eq!(ripc.ping_message(), &[0, 3, 2]);
    }

    #[test]
    fn test_parse_transport_protocol() {
        assert_eq!(
            "ws-json".parse::<TransportProtocol>().unwrap(),
            TransportProtocol::WebSocketJson
        );
        assert!("http".parse::<TransportProtocol>().is_err());
    }

    #[test]
    fn test_factory_reports_transport() {
        for transport in [
            TransportProtocol::Ripc,
            TransportProtocol::WebSocketRwf,
            TransportProtocol::WebSocketJson,
        ] {
            assert_eq!(protocol_for(transport, Role::Client).transport(), transport);
        }
    }
}
