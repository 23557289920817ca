//! Connection handshake.
//!
//! Before any record flows, the client sends a connection request naming one
//! protocol version and the compression types it accepts. The server answers
//! with an ack fixing the session parameters, or a NAK with a reason.
//!
//! Wire format (big-endian):
//! ```text
//! ConnectReq: len u16 | 0 | version u32 | compression bitmap u8 | ping timeout u8
//!             | session flags u8 | component info len u16 | component info
//! ConnectAck: len u16 | 1 | version u32 | max user msg size u16 | compression u8
//!             | compression level u8 | ping timeout u8 | session flags u8
//! ConnectNak: len u16 | 2 | reason text
//! ```

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use ripc_frame::wire::PACKED_ENTRY_HEADER_SIZE;
use ripc_frame::{CompressionType, ProtocolVersion};
use ripc_transport::TransportError;
use tracing::debug;

use crate::error::{ChannelError, Result};

const CONNECT_REQ: u8 = 0;
const CONNECT_ACK: u8 = 1;
const CONNECT_NAK: u8 = 2;

const PREFIX_LEN: usize = 3;
const REQ_FIXED_LEN: usize = 12;
const ACK_LEN: usize = 13;
const MAX_HANDSHAKE_LEN: usize = 2048;
const MAX_COMPONENT_INFO_LEN: usize = 1024;
const MAX_NAK_REASON_LEN: usize = 512;
const READ_CHUNK: usize = 512;

/// Smallest max-user-message size a client accepts from the server.
pub const MIN_USER_MSG_SIZE: usize = 64;

/// Session flag bits exchanged in the request and ack.
pub mod session_flags {
    /// The client sends heartbeats to the server.
    pub const CLIENT_TO_SERVER_PING: u8 = 0x01;
    /// The server sends heartbeats to the client.
    pub const SERVER_TO_CLIENT_PING: u8 = 0x02;
}

/// Client connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReq {
    pub version: ProtocolVersion,
    /// OR of [`CompressionType::bitmap_bit`] for every accepted type.
    pub compression_bitmap: u8,
    /// Requested ping timeout in seconds.
    pub ping_timeout: u8,
    pub session_flags: u8,
    /// Opaque component description, e.g. product name and version.
    pub component_info: Vec<u8>,
}

/// Server acceptance fixing the session parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    pub version: ProtocolVersion,
    pub max_user_msg_size: u16,
    pub compression: CompressionType,
    pub compression_level: u8,
    pub ping_timeout: u8,
    pub session_flags: u8,
}

/// One handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    Request(ConnectReq),
    Ack(ConnectAck),
    Nak(String),
}

impl HandshakeMessage {
    /// Append the encoded message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Request(req) => {
                if req.component_info.len() > MAX_COMPONENT_INFO_LEN {
                    return Err(ChannelError::HandshakeFailed(format!(
                        "component info too long: {} (max {MAX_COMPONENT_INFO_LEN})",
                        req.component_info.len()
                    )));
                }
                dst.put_u16((REQ_FIXED_LEN + req.component_info.len()) as u16);
                dst.put_u8(CONNECT_REQ);
                dst.put_u32(req.version.ripc());
                dst.put_u8(req.compression_bitmap);
                dst.put_u8(req.ping_timeout);
                dst.put_u8(req.session_flags);
                dst.put_u16(req.component_info.len() as u16);
                dst.put_slice(&req.component_info);
            }
            Self::Ack(ack) => {
                dst.put_u16(ACK_LEN as u16);
                dst.put_u8(CONNECT_ACK);
                dst.put_u32(ack.version.ripc());
                dst.put_u16(ack.max_user_msg_size);
                dst.put_u8(ack.compression.code());
                dst.put_u8(ack.compression_level);
                dst.put_u8(ack.ping_timeout);
                dst.put_u8(ack.session_flags);
            }
            Self::Nak(reason) => {
                let text = truncate_reason(reason);
                dst.put_u16((PREFIX_LEN + text.len()) as u16);
                dst.put_u8(CONNECT_NAK);
                dst.put_slice(text.as_bytes());
            }
        }
        Ok(())
    }

    /// Decode the message at the front of `src`.
    ///
    /// Returns the message and the bytes it occupied, or `Ok(None)` until
    /// the whole message has arrived.
    pub fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if !(PREFIX_LEN..=MAX_HANDSHAKE_LEN).contains(&len) {
            return Err(ChannelError::HandshakeFailed(format!(
                "invalid handshake message length {len}"
            )));
        }
        if src.len() < len {
            return Ok(None);
        }

        let mut body = &src[PREFIX_LEN..len];
        let message = match src[2] {
            CONNECT_REQ => {
                if len < REQ_FIXED_LEN {
                    return Err(ChannelError::HandshakeFailed(
                        "truncated connection request".to_string(),
                    ));
                }
                let version = ProtocolVersion::new(body.get_u32());
                let compression_bitmap = body.get_u8();
                let ping_timeout = body.get_u8();
                let session_flags = body.get_u8();
                let info_len = usize::from(body.get_u16());
                if info_len != body.remaining() {
                    return Err(ChannelError::HandshakeFailed(format!(
                        "component info length {info_len} does not match the {} bytes sent",
                        body.remaining()
                    )));
                }
                Self::Request(ConnectReq {
                    version,
                    compression_bitmap,
                    ping_timeout,
                    session_flags,
                    component_info: body.to_vec(),
                })
            }
            CONNECT_ACK => {
                if len != ACK_LEN {
                    return Err(ChannelError::HandshakeFailed(format!(
                        "connection ack must be {ACK_LEN} bytes, got {len}"
                    )));
                }
                let version = ProtocolVersion::new(body.get_u32());
                let max_user_msg_size = body.get_u16();
                let code = body.get_u8();
                let compression = CompressionType::from_code(code).ok_or_else(|| {
                    ChannelError::HandshakeFailed(format!("unknown compression type {code}"))
                })?;
                Self::Ack(ConnectAck {
                    version,
                    max_user_msg_size,
                    compression,
                    compression_level: body.get_u8(),
                    ping_timeout: body.get_u8(),
                    session_flags: body.get_u8(),
                })
            }
            CONNECT_NAK => Self::Nak(String::from_utf8_lossy(body).into_owned()),
            other => {
                return Err(ChannelError::HandshakeFailed(format!(
                    "unknown handshake opcode {other}"
                )))
            }
        };
        Ok(Some((message, len)))
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_NAK_REASON_LEN {
        return reason;
    }
    let mut end = MAX_NAK_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Handshake settings for either side of a connection.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange.
    pub timeout: Duration,
    /// Client: versions to offer, newest first. Server: versions accepted.
    pub protocol_versions: Vec<ProtocolVersion>,
    /// Client: types accepted. Server: types in order of preference.
    pub compression: Vec<CompressionType>,
    /// Level the server assigns to zlib sessions (0-9).
    pub compression_level: u32,
    /// Client: requested. Server: upper bound.
    pub ping_timeout: Duration,
    pub session_flags: u8,
    /// Server: largest application message per record.
    pub max_user_msg_size: usize,
    /// Client: sent to the server in the request.
    pub component_info: Vec<u8>,
}

impl HandshakeConfig {
    pub fn with_protocol_versions(mut self, versions: &[ProtocolVersion]) -> Self {
        self.protocol_versions = versions.to_vec();
        self
    }

    pub fn with_compression(mut self, types: &[CompressionType]) -> Self {
        self.compression = types.to_vec();
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_max_user_msg_size(mut self, size: usize) -> Self {
        self.max_user_msg_size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_component_info(mut self, info: impl Into<Vec<u8>>) -> Self {
        self.component_info = info.into();
        self
    }

    fn compression_bitmap(&self) -> u8 {
        self.compression
            .iter()
            .fold(0, |bitmap, kind| bitmap | kind.bitmap_bit())
    }

    fn ping_timeout_secs(&self) -> u8 {
        self.ping_timeout.as_secs().clamp(1, u64::from(u8::MAX)) as u8
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_versions: ProtocolVersion::SUPPORTED.to_vec(),
            compression: Vec::new(),
            compression_level: 6,
            ping_timeout: Duration::from_secs(60),
            session_flags: session_flags::CLIENT_TO_SERVER_PING
                | session_flags::SERVER_TO_CLIENT_PING,
            max_user_msg_size: ripc_frame::wire::DEFAULT_MAX_USER_MSG_SIZE,
            component_info: format!("ripc {}", env!("CARGO_PKG_VERSION")).into_bytes(),
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .field("protocol_versions", &self.protocol_versions)
            .field("compression", &self.compression)
            .field("compression_level", &self.compression_level)
            .field("ping_timeout", &self.ping_timeout)
            .field("session_flags", &self.session_flags)
            .field("max_user_msg_size", &self.max_user_msg_size)
            .field(
                "component_info",
                &String::from_utf8_lossy(&self.component_info),
            )
            .finish()
    }
}

/// Parameters both sides agreed on. Read-only for the life of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub version: ProtocolVersion,
    pub max_user_msg_size: usize,
    pub compression: CompressionType,
    pub compression_level: u32,
    pub ping_timeout: Duration,
    pub session_flags: u8,
    /// Component info the peer sent (empty on the client side).
    pub peer_component_info: Vec<u8>,
}

impl SessionParams {
    /// Largest message an application may put in one packed entry.
    pub fn max_fragment_size(&self) -> usize {
        self.max_user_msg_size - PACKED_ENTRY_HEADER_SIZE
    }

    pub fn client_to_server_pings(&self) -> bool {
        self.session_flags & session_flags::CLIENT_TO_SERVER_PING != 0
    }

    pub fn server_to_client_pings(&self) -> bool {
        self.session_flags & session_flags::SERVER_TO_CLIENT_PING != 0
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub params: SessionParams,
    /// Bytes read past the handshake reply; they belong to the first records.
    pub leftover: Vec<u8>,
}

/// Client side: request `version` and wait for the ack.
pub fn handshake_client<S: Read + Write>(
    stream: &mut S,
    version: ProtocolVersion,
    config: &HandshakeConfig,
) -> Result<Handshake> {
    let bitmap = config.compression_bitmap();
    let request = HandshakeMessage::Request(ConnectReq {
        version,
        compression_bitmap: bitmap,
        ping_timeout: config.ping_timeout_secs(),
        session_flags: config.session_flags,
        component_info: config.component_info.clone(),
    });
    send_message(stream, &request)?;
    debug!(%version, compression_bitmap = bitmap, "sent connection request");

    let (reply, leftover) = read_message(stream, config.timeout)?;
    let ack = match reply {
        HandshakeMessage::Ack(ack) => ack,
        HandshakeMessage::Nak(reason) => return Err(ChannelError::Rejected(reason)),
        HandshakeMessage::Request(_) => {
            return Err(ChannelError::HandshakeFailed(
                "peer sent a connection request instead of a reply".to_string(),
            ))
        }
    };

    if ack.version != version {
        return Err(ChannelError::HandshakeFailed(format!(
            "server acked {} for a {version} request",
            ack.version
        )));
    }
    if ack.compression != CompressionType::None && bitmap & ack.compression.bitmap_bit() == 0 {
        return Err(ChannelError::HandshakeFailed(format!(
            "server chose {} compression, which was not offered",
            ack.compression.name()
        )));
    }
    let max_user_msg_size = usize::from(ack.max_user_msg_size);
    if max_user_msg_size < MIN_USER_MSG_SIZE {
        return Err(ChannelError::HandshakeFailed(format!(
            "max user message size {max_user_msg_size} below minimum {MIN_USER_MSG_SIZE}"
        )));
    }

    debug!(
        %version,
        max_user_msg_size,
        compression = ack.compression.name(),
        leftover = leftover.len(),
        "connection acked"
    );
    Ok(Handshake {
        params: SessionParams {
            version,
            max_user_msg_size,
            compression: ack.compression,
            compression_level: u32::from(ack.compression_level),
            ping_timeout: Duration::from_secs(u64::from(ack.ping_timeout)),
            session_flags: ack.session_flags,
            peer_component_info: Vec::new(),
        },
        leftover,
    })
}

/// Server side: read the request, then ack or NAK it.
///
/// An unsupported version is NAKed and reported as
/// [`ChannelError::VersionUnsupported`]; the client may reconnect with an
/// older version.
pub fn handshake_server<S: Read + Write>(
    stream: &mut S,
    config: &HandshakeConfig,
) -> Result<Handshake> {
    let (message, leftover) = read_message(stream, config.timeout)?;
    let HandshakeMessage::Request(req) = message else {
        return Err(ChannelError::HandshakeFailed(
            "expected a connection request".to_string(),
        ));
    };

    if !config.protocol_versions.contains(&req.version) {
        debug!(version = req.version.ripc(), "rejecting unsupported version");
        let nak = HandshakeMessage::Nak(format!(
            "unsupported protocol version {}",
            req.version.ripc()
        ));
        send_message(stream, &nak)?;
        return Err(ChannelError::VersionUnsupported(req.version.ripc()));
    }

    let compression = config
        .compression
        .iter()
        .copied()
        .find(|kind| {
            *kind != CompressionType::None && req.compression_bitmap & kind.bitmap_bit() != 0
        })
        .unwrap_or_default();
    let ping_timeout = req.ping_timeout.min(config.ping_timeout_secs());
    let max_user_msg_size = config.max_user_msg_size.min(usize::from(u16::MAX));
    let compression_level = config.compression_level.min(9);

    let ack = ConnectAck {
        version: req.version,
        max_user_msg_size: max_user_msg_size as u16,
        compression,
        compression_level: compression_level as u8,
        ping_timeout,
        session_flags: config.session_flags,
    };
    send_message(stream, &HandshakeMessage::Ack(ack))?;
    debug!(
        version = %req.version,
        compression = compression.name(),
        ping_timeout,
        "accepted connection request"
    );

    Ok(Handshake {
        params: SessionParams {
            version: req.version,
            max_user_msg_size,
            compression,
            compression_level,
            ping_timeout: Duration::from_secs(u64::from(ping_timeout)),
            session_flags: config.session_flags,
            peer_component_info: req.component_info,
        },
        leftover,
    })
}

fn send_message<W: Write>(stream: &mut W, message: &HandshakeMessage) -> Result<()> {
    let mut buf = BytesMut::with_capacity(64);
    message.encode(&mut buf)?;
    stream.write_all(&buf).map_err(TransportError::Io)?;
    stream.flush().map_err(TransportError::Io)?;
    Ok(())
}

fn read_message<R: Read>(
    stream: &mut R,
    timeout: Duration,
) -> Result<(HandshakeMessage, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if let Some((message, used)) = HandshakeMessage::decode(&buf)? {
            return Ok((message, buf.split_off(used)));
        }
        if Instant::now() >= deadline {
            return Err(ChannelError::Timeout(timeout));
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(ChannelError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => return Err(TransportError::Io(err).into()),
        }
    }
}
