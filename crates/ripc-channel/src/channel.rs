use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ripc_frame::websocket::MAX_HEADER_SIZE;
use ripc_frame::wire::FIRST_FRAGMENT_HEADER_SIZE;
use ripc_frame::{
    compressor_for, protocol_for, CompressionType, ControlFrame, FrameError, Priority,
    ProtocolVersion, ReadOutcome, RecordReader, RecordWriter, Role, TransportProtocol,
    WriteBuffer,
};
use ripc_transport::RipcStream;
use tracing::{debug, info};

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::handshake::Handshake;

/// Result of one [`Channel::read`] call.
///
/// [`Channel::read_with`] carries whatever its callback made of the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent<M = Bytes> {
    /// One complete message.
    Message(M),
    /// The peer's heartbeat.
    Ping,
    /// Nothing to deliver yet; poll again when the socket is readable.
    WouldBlock,
    /// Part of a record is buffered.
    Pending(usize),
}

/// Negotiated parameters of an active channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub role: Role,
    pub transport: TransportProtocol,
    /// Underlying stream kind (`tcp` or `unix`).
    pub stream: &'static str,
    pub version: ProtocolVersion,
    pub max_user_msg_size: usize,
    /// Largest message that fits one packed entry.
    pub max_fragment_size: usize,
    pub compression: CompressionType,
    pub compression_level: u32,
    pub ping_timeout: Duration,
    pub client_to_server_pings: bool,
    pub server_to_client_pings: bool,
    pub peer_component_info: String,
}

impl ChannelInfo {
    /// How often this side should send heartbeats.
    pub fn ping_interval(&self) -> Duration {
        self.ping_timeout / 3
    }
}

/// An active RIPC connection.
///
/// Reads and writes take independent locks, so one thread may read while
/// another writes and flushes. Only one thread reads at a time; a second
/// concurrent reader gets [`ChannelError::ReadInProgress`].
pub struct Channel {
    reader: Mutex<RecordReader<RipcStream>>,
    writer: Mutex<RecordWriter<RipcStream>>,
    stream: RipcStream,
    info: ChannelInfo,
    read_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl Channel {
    /// Build the read and write paths from a completed handshake.
    pub(crate) fn establish(
        stream: RipcStream,
        handshake: Handshake,
        role: Role,
        config: &ChannelConfig,
    ) -> Result<Self> {
        let Handshake { params, leftover } = handshake;
        let record_ceiling =
            params.max_user_msg_size + FIRST_FRAGMENT_HEADER_SIZE + 2 + MAX_HEADER_SIZE;
        let frame = config
            .frame
            .clone()
            .with_max_user_msg_size(params.max_user_msg_size)
            .with_read_buffer_capacity(config.frame.read_buffer_capacity.max(record_ceiling));

        let mut reader = RecordReader::with_stream(
            stream.try_clone()?,
            config.pool(),
            &frame,
            protocol_for(config.transport, role),
            params.version,
        )?;
        reader.set_compressor(compressor_for(params.compression, params.compression_level));
        reader.preload(&leftover)?;

        let mut writer = RecordWriter::with_stream(
            stream.try_clone()?,
            protocol_for(config.transport, role),
            params.version,
            &frame,
            config.writer.clone(),
        )?;
        writer.set_compressor(compressor_for(params.compression, params.compression_level));

        let info = ChannelInfo {
            role,
            transport: config.transport,
            stream: stream.transport_name(),
            version: params.version,
            max_user_msg_size: params.max_user_msg_size,
            max_fragment_size: params.max_fragment_size(),
            compression: params.compression,
            compression_level: params.compression_level,
            ping_timeout: params.ping_timeout,
            client_to_server_pings: params.client_to_server_pings(),
            server_to_client_pings: params.server_to_client_pings(),
            peer_component_info: String::from_utf8_lossy(&params.peer_component_info)
                .into_owned(),
        };
        info!(
            role = ?info.role,
            version = %info.version,
            compression = info.compression.name(),
            transport = info.transport.name(),
            "channel active"
        );

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            stream,
            info,
            read_timeout: frame.read_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Read at most one message, performing at most one socket read.
    ///
    /// The message is copied out of the read buffer so it outlives the next
    /// read; use [`Channel::read_with`] to borrow it in place.
    pub fn read(&self) -> Result<ReadEvent> {
        self.read_with(Bytes::copy_from_slice)
    }

    /// Like [`Channel::read`], but hands a message to `f` as a view into the
    /// read buffer.
    ///
    /// `f` runs with the read lock held, so reading from the same channel
    /// inside it fails with [`ChannelError::ReadInProgress`]; writing is fine.
    pub fn read_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<ReadEvent<R>> {
        self.ensure_open()?;
        let mut reader = match self.reader.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ChannelError::ReadInProgress),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let outcome = match reader.read() {
            Ok(ReadOutcome::Message(data)) => Ok(ReadEvent::Message(f(data))),
            Ok(ReadOutcome::Ping) => Ok(ReadEvent::Ping),
            Ok(ReadOutcome::WouldBlock) => Ok(ReadEvent::WouldBlock),
            Ok(ReadOutcome::Pending(n)) => Ok(ReadEvent::Pending(n)),
            Err(err) => Err(err),
        };
        let control = reader.take_control_frame();
        drop(reader);

        if let Some(frame) = control {
            let replied = self.answer_control(&frame);
            // a failed reply only matters while the read itself succeeded
            if outcome.is_ok() {
                replied?;
            }
        }
        outcome.map_err(|err| self.fail(err))
    }

    /// Read until a message arrives, skipping heartbeats.
    ///
    /// With a read timeout configured, gives up with
    /// [`ChannelError::Timeout`] once that long passes without a message.
    pub fn read_message(&self) -> Result<Bytes> {
        self.read_message_with(Bytes::copy_from_slice)
    }

    /// [`Channel::read_message`] without the copy; see [`Channel::read_with`].
    pub fn read_message_with<R>(&self, mut f: impl FnMut(&[u8]) -> R) -> Result<R> {
        let started = Instant::now();
        loop {
            match self.read_with(&mut f)? {
                ReadEvent::Message(data) => return Ok(data),
                ReadEvent::WouldBlock => {
                    if let Some(timeout) = self.read_timeout {
                        if started.elapsed() >= timeout {
                            return Err(ChannelError::Timeout(timeout));
                        }
                    }
                }
                ReadEvent::Ping | ReadEvent::Pending(_) => {}
            }
        }
    }

    /// Frame and queue one message. Returns the bytes still queued.
    pub fn write(&self, payload: &[u8], priority: Priority) -> Result<usize> {
        self.ensure_open()?;
        let result = self.writer().send(payload, priority);
        result.map_err(|err| self.fail(err))
    }

    /// A buffer for several packed messages, or one large message.
    pub fn get_buffer(&self, len: usize, packed: bool) -> Result<WriteBuffer> {
        self.ensure_open()?;
        let result = self.writer().get_buffer(len, packed);
        result.map_err(ChannelError::from)
    }

    /// Queue a buffer from [`Self::get_buffer`]. Returns the bytes still queued.
    pub fn write_buffer(&self, buffer: WriteBuffer, priority: Priority) -> Result<usize> {
        self.ensure_open()?;
        let result = self.writer().write(buffer, priority);
        result.map_err(|err| self.fail(err))
    }

    /// Write queued records. Returns the bytes still queued.
    pub fn flush(&self) -> Result<usize> {
        self.ensure_open()?;
        let result = self.writer().flush();
        result.map_err(|err| self.fail(err))
    }

    /// Send a heartbeat (or flush pending data, which serves the same purpose).
    pub fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        let result = self.writer().ping();
        result.map_err(|err| self.fail(err))
    }

    /// Flush what can be flushed and shut the connection down.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = self.writer().flush() {
            debug!(error = %err, "flush on close failed");
        }
        self.stream.shutdown()?;
        debug!(role = ?self.info.role, "channel closed");
        Ok(())
    }

    fn writer(&self) -> MutexGuard<'_, RecordWriter<RipcStream>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer_control(&self, frame: &ControlFrame) -> Result<()> {
        if matches!(frame, ControlFrame::Close(_)) {
            debug!("peer closed the websocket");
        }
        let result = self.writer().reply_to_control(frame);
        result.map_err(|err| self.fail(err))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    fn fail(&self, err: FrameError) -> ChannelError {
        let err = match err {
            FrameError::ConnectionClosed => ChannelError::Closed,
            other => ChannelError::Frame(other),
        };
        if err.is_fatal() {
            self.closed.store(true, Ordering::Release);
        }
        err
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("info", &self.info)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Write;
    use std::thread;

    use bytes::BytesMut;
    use ripc_frame::encode_plain;

    use super::*;
    use crate::connector::connect_stream;
    use crate::handshake::{ConnectAck, HandshakeMessage};
    use crate::listener::accept_stream;

    fn pair_with(config: ChannelConfig) -> (Channel, Channel) {
        let (client_side, server_side) = RipcStream::pair().unwrap();
        let server_config = config.clone();
        let server = thread::spawn(move || accept_stream(server_side, &server_config).unwrap());
        let client = connect_stream(client_side, ProtocolVersion::V14, &config).unwrap();
        (client, server.join().unwrap())
    }

    fn pair() -> (Channel, Channel) {
        pair_with(ChannelConfig::default())
    }

    #[test]
    fn message_round_trip_both_ways() {
        let (client, server) = pair();

        client.write(b"request", Priority::Medium).unwrap();
        assert_eq!(client.flush().unwrap(), 0);
        assert_eq!(server.read_message().unwrap(), Bytes::from_static(b"request"));

        server.write(b"response", Priority::High).unwrap();
        server.flush().unwrap();
        assert_eq!(client.read_message().unwrap(), Bytes::from_static(b"response"));
    }

    #[test]
    fn read_with_borrows_the_message_in_place() {
        let (client, server) = pair();
        client.write(b"borrowed", Priority::Medium).unwrap();
        client.write(b"second", Priority::Medium).unwrap();
        client.flush().unwrap();

        let len = server.read_message_with(|data| {
            assert_eq!(data, b"borrowed");
            assert!(matches!(server.read(), Err(ChannelError::ReadInProgress)));
            data.len()
        });
        assert_eq!(len.unwrap(), 8);
        assert!(server.is_open());
        assert_eq!(server.read_message().unwrap(), Bytes::from_static(b"second"));
    }

    #[test]
    fn large_compressed_message_is_fragmented_and_reassembled() {
        let config = ChannelConfig::default().with_compression(&[CompressionType::Zlib]);
        let (client, server) = pair_with(config);
        assert_eq!(client.info().compression, CompressionType::Zlib);

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 97) as u8).collect();
        let writer = thread::spawn(move || {
            client.write(&payload, Priority::Medium).unwrap();
            client.flush().unwrap();
            (client, payload)
        });

        let received = server.read_message().unwrap();
        let (_client, payload) = writer.join().unwrap();
        assert_eq!(received.as_ref(), payload.as_slice());
    }

    #[test]
    fn packed_buffer_delivers_each_message() {
        let (client, server) = pair();

        let mut buffer = client.get_buffer(200, true).unwrap();
        buffer.put_slice(b"alpha").unwrap();
        buffer.pack().unwrap();
        buffer.put_slice(b"beta").unwrap();
        client.write_buffer(buffer, Priority::Low).unwrap();
        client.flush().unwrap();

        assert_eq!(server.read_message().unwrap(), Bytes::from_static(b"alpha"));
        assert_eq!(server.read_message().unwrap(), Bytes::from_static(b"beta"));
    }

    #[test]
    fn heartbeat_surfaces_as_ping() {
        let (client, server) = pair();
        client.ping().unwrap();
        loop {
            match server.read().unwrap() {
                ReadEvent::Ping => break,
                ReadEvent::WouldBlock | ReadEvent::Pending(_) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn concurrent_read_is_refused() {
        let (_client, server) = pair();
        let _held = server.reader.lock().unwrap();
        assert!(matches!(server.read(), Err(ChannelError::ReadInProgress)));
    }

    #[test]
    fn peer_close_ends_reads() {
        let (client, server) = pair();
        client.close().unwrap();
        assert!(!client.is_open());
        assert!(matches!(client.write(b"late", Priority::Medium), Err(ChannelError::Closed)));

        let err = server.read_message().unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
        assert!(!server.is_open());
    }

    #[test]
    fn info_reports_negotiated_parameters() {
        let config = ChannelConfig::default()
            .with_max_user_msg_size(4096)
            .with_ping_timeout(Duration::from_secs(30));
        let (client, server) = pair_with(config);

        for channel in [&client, &server] {
            let info = channel.info();
            assert_eq!(info.version, ProtocolVersion::V14);
            assert_eq!(info.max_user_msg_size, 4096);
            assert_eq!(info.max_fragment_size, 4094);
            assert_eq!(info.ping_timeout, Duration::from_secs(30));
            assert_eq!(info.ping_interval(), Duration::from_secs(10));
            assert_eq!(info.stream, "unix");
        }
        assert_eq!(client.info().role, Role::Client);
        assert_eq!(server.info().role, Role::Server);
        assert!(server.info().peer_component_info.starts_with("ripc "));
    }

    #[test]
    fn read_timeout_yields_timeout_error() {
        let config = ChannelConfig::default().with_read_timeout(Some(Duration::from_millis(20)));
        let (_client, server) = pair_with(config);
        assert!(matches!(server.read_message(), Err(ChannelError::Timeout(_))));
        assert!(server.is_open());
    }

    #[test]
    fn records_sent_with_the_ack_are_not_lost() {
        let (client_side, mut server_side) = RipcStream::pair().unwrap();
        let server = thread::spawn(move || {
            let mut reply = BytesMut::new();
            HandshakeMessage::Ack(ConnectAck {
                version: ProtocolVersion::V14,
                max_user_msg_size: 6144,
                compression: CompressionType::None,
                compression_level: 0,
                ping_timeout: 60,
                session_flags: 0,
            })
            .encode(&mut reply)
            .unwrap();
            encode_plain(b"eager", &mut reply).unwrap();
            // the request is ignored; reply and first record go out in one write
            server_side.write_all(&reply).unwrap();
            server_side
        });

        let client =
            connect_stream(client_side, ProtocolVersion::V14, &ChannelConfig::default()).unwrap();
        let _server_side = server.join().unwrap();
        assert_eq!(client.read_message().unwrap(), Bytes::from_static(b"eager"));
    }
}
