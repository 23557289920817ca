use std::collections::VecDeque;
use std::io::{ErrorKind, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ripc_transport::RipcStream;
use tracing::{debug, trace};

use crate::codec::{encode_record, FrameConfig, FragmentHeader};
use crate::compress::{CompressionType, Compressor, NoCompressor};
use crate::error::{FrameError, Result};
use crate::protocol::{ControlFrame, ProtocolFunctions};
use crate::reader::transport_to_frame_error;
use crate::websocket::MAX_HEADER_SIZE;
use crate::wire::{
    flags, ProtocolVersion, FIRST_FRAGMENT_HEADER_SIZE, HEADER_SIZE, MAX_RECORD_SIZE,
    PACKED_ENTRY_HEADER_SIZE,
};

/// Default flush order: high twice as often as medium, low once per cycle.
pub const DEFAULT_FLUSH_STRATEGY: &str = "HMHLHM";

/// Queue a written message waits in until flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

/// Parse a flush strategy such as `"HMHLHM"`.
pub fn parse_flush_strategy(strategy: &str) -> Result<Vec<Priority>> {
    let order = strategy
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            'H' => Ok(Priority::High),
            'M' => Ok(Priority::Medium),
            'L' => Ok(Priority::Low),
            other => Err(FrameError::InvalidArgument(format!(
                "flush strategy may only contain H, M and L, found {other:?}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    if order.is_empty() {
        return Err(FrameError::InvalidArgument(
            "flush strategy must not be empty".to_string(),
        ));
    }
    Ok(order)
}

/// Write-side configuration.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Order in which the priority queues are drained.
    pub priority_flush_strategy: String,
    /// Queued bytes above which `write` flushes on its own.
    pub high_water_mark: usize,
    /// Smallest body worth compressing; `None` uses the compression type's default.
    pub compression_threshold: Option<usize>,
}

impl WriterConfig {
    pub fn with_priority_flush_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.priority_flush_strategy = strategy.into();
        self
    }

    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = Some(bytes);
        self
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            priority_flush_strategy: DEFAULT_FLUSH_STRATEGY.to_string(),
            high_water_mark: 6 * 1024,
            compression_threshold: None,
        }
    }
}

/// Byte counts for the last write or flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteArgs {
    /// Bytes queued or sent on the wire, headers included.
    pub bytes_written: usize,
    /// The same message measured before compression.
    pub uncompressed_bytes_written: usize,
}

/// A message being assembled before [`RecordWriter::write`].
///
/// Packed buffers collect several messages; call [`WriteBuffer::pack`] after
/// each one.
#[derive(Debug)]
pub struct WriteBuffer {
    packed: bool,
    json: bool,
    capacity: usize,
    body: BytesMut,
    current: BytesMut,
    entries: usize,
}

impl WriteBuffer {
    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Bytes written so far, including closed packed entries.
    pub fn len(&self) -> usize {
        self.body.len() + self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Room left for the open message.
    pub fn remaining(&self) -> usize {
        let overhead = if self.packed { self.entry_overhead() } else { 0 };
        self.capacity
            .saturating_sub(self.body.len() + overhead + self.current.len())
    }

    /// Append bytes to the open message.
    pub fn put_slice(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.remaining() {
            return Err(FrameError::PayloadTooLarge {
                size: self.current.len() + data.len(),
                max: self.current.len() + self.remaining(),
            });
        }
        self.current.put_slice(data);
        Ok(())
    }

    /// Close the open message of a packed buffer. Returns the room left.
    pub fn pack(&mut self) -> Result<usize> {
        if !self.packed {
            return Err(FrameError::InvalidArgument(
                "pack called on a buffer that is not packed".to_string(),
            ));
        }
        if self.json {
            if self.entries > 0 {
                self.body.put_u8(b',');
            }
        } else {
            self.body.put_u16(self.current.len() as u16);
        }
        self.body.put_slice(&self.current);
        self.current.clear();
        self.entries += 1;
        Ok(self.remaining())
    }

    fn entry_overhead(&self) -> usize {
        match (self.json, self.entries) {
            (false, _) => PACKED_ENTRY_HEADER_SIZE,
            (true, 0) => 0,
            (true, _) => 1,
        }
    }
}

/// Writes RIPC records to any `Write` stream.
///
/// Messages are framed on `write` and parked on one of three priority queues;
/// `flush` drains the queues in the configured order.
pub struct RecordWriter<T> {
    inner: T,
    protocol: Box<dyn ProtocolFunctions>,
    compressor: Box<dyn Compressor>,
    version: ProtocolVersion,
    max_fragment_size: usize,
    compression_threshold: usize,
    compression_priority: Option<Priority>,
    config: WriterConfig,
    strategy: Vec<Priority>,
    strategy_pos: usize,
    queues: [VecDeque<Bytes>; 3],
    in_flight: Option<Bytes>,
    queued_bytes: usize,
    next_fragment_id: u16,
    record: BytesMut,
    compressed: Vec<u8>,
    args: WriteArgs,
}

impl<T: Write> RecordWriter<T> {
    /// Create a writer whose records carry at most `max_user_msg_size` body bytes.
    pub fn new(
        inner: T,
        protocol: Box<dyn ProtocolFunctions>,
        version: ProtocolVersion,
        max_user_msg_size: usize,
        config: WriterConfig,
    ) -> Result<Self> {
        let strategy = parse_flush_strategy(&config.priority_flush_strategy)?;
        let ceiling = MAX_RECORD_SIZE - FIRST_FRAGMENT_HEADER_SIZE - version.fragment_id_width();
        if max_user_msg_size <= FIRST_FRAGMENT_HEADER_SIZE {
            return Err(FrameError::InvalidArgument(format!(
                "max user message size {max_user_msg_size} leaves no room for fragment data"
            )));
        }
        Ok(Self {
            inner,
            protocol,
            compressor: Box::new(NoCompressor),
            version,
            max_fragment_size: max_user_msg_size.min(ceiling),
            compression_threshold: usize::MAX,
            compression_priority: None,
            config,
            strategy,
            strategy_pos: 0,
            queues: Default::default(),
            in_flight: None,
            queued_bytes: 0,
            next_fragment_id: 1,
            record: BytesMut::new(),
            compressed: Vec::new(),
            args: WriteArgs::default(),
        })
    }

    /// Create a writer from a [`FrameConfig`].
    pub fn with_config(
        inner: T,
        protocol: Box<dyn ProtocolFunctions>,
        version: ProtocolVersion,
        frame: &FrameConfig,
        config: WriterConfig,
    ) -> Result<Self> {
        Self::new(inner, protocol, version, frame.max_fragment_size(), config)
    }

    /// Set the compressor negotiated for the connection.
    pub fn set_compressor(&mut self, compressor: Box<dyn Compressor>) {
        let kind = compressor.compression_type();
        self.compression_threshold = match kind {
            CompressionType::None => usize::MAX,
            _ => self
                .config
                .compression_threshold
                .unwrap_or_else(|| kind.default_threshold()),
        };
        self.compressor = compressor;
        self.compression_priority = None;
    }

    /// Priority whose messages are compressed, fixed by the first compressed write.
    pub fn compression_priority(&self) -> Option<Priority> {
        self.compression_priority
    }

    /// Largest body carried by one record.
    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    /// Get a buffer for a message of up to `len` bytes.
    ///
    /// Packed buffers are limited to one record; plain buffers larger than a
    /// record are fragmented on write.
    pub fn get_buffer(&self, len: usize, packed: bool) -> Result<WriteBuffer> {
        let json = !self.protocol.is_rwf_protocol();
        if packed && len > self.max_fragment_size {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.max_fragment_size,
            });
        }
        if !json && len > u32::MAX as usize {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: u32::MAX as usize,
            });
        }
        Ok(WriteBuffer {
            packed,
            json,
            capacity: len,
            body: BytesMut::with_capacity(if packed { len } else { 0 }),
            current: BytesMut::with_capacity(if packed { 0 } else { len }),
            entries: 0,
        })
    }

    /// Frame a finished buffer and queue it. Returns the bytes still queued.
    ///
    /// Crossing the high-water mark triggers a flush.
    pub fn write(&mut self, mut buffer: WriteBuffer, priority: Priority) -> Result<usize> {
        self.args = WriteArgs::default();
        if buffer.packed {
            if !buffer.current.is_empty() || buffer.entries == 0 {
                buffer.pack()?;
            }
            self.write_packed(&buffer.body, buffer.json, priority)?;
        } else if buffer.json {
            self.write_json(&buffer.current, priority)?;
        } else if buffer.current.len() > self.max_fragment_size {
            self.write_fragmented(&buffer.current, priority)?;
        } else {
            self.write_single(&buffer.current, flags::DATA, priority)?;
        }

        if self.queued_bytes >= self.config.high_water_mark {
            trace!(queued = self.queued_bytes, "high-water mark reached, flushing");
            return self.flush();
        }
        Ok(self.queued_bytes)
    }

    /// Frame and queue `payload` in one step.
    pub fn send(&mut self, payload: &[u8], priority: Priority) -> Result<usize> {
        let mut buffer = self.get_buffer(payload.len(), false)?;
        buffer.put_slice(payload)?;
        self.write(buffer, priority)
    }

    fn write_single(&mut self, body: &[u8], record_flags: u8, priority: Priority) -> Result<()> {
        self.args.uncompressed_bytes_written += HEADER_SIZE + body.len();
        if self.compresses(body.len(), None, priority) {
            self.queue_compressed(record_flags, None, body, priority)
        } else {
            self.queue_record(record_flags, None, body, priority)
        }
    }

    fn write_packed(&mut self, body: &[u8], json: bool, priority: Priority) -> Result<()> {
        if json {
            let mut text = BytesMut::with_capacity(body.len() + 2);
            self.protocol.write_additional_message_prefix(&mut text);
            text.put_slice(body);
            text.put_u8(b']');
            self.args.uncompressed_bytes_written += text.len();
            return self.queue_json(&text, priority);
        }
        self.write_single(body, flags::DATA | flags::PACKING, priority)
    }

    fn write_fragmented(&mut self, payload: &[u8], priority: Priority) -> Result<()> {
        let total_len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        let fragment_id = self.allocate_fragment_id();
        debug!(fragment_id, total_len, "fragmenting message");

        let mut first = true;
        let mut rest = payload;
        while first || !rest.is_empty() {
            let header = if first {
                FragmentHeader::First {
                    fragment_id,
                    total_len,
                }
            } else {
                FragmentHeader::Continuation { fragment_id }
            };
            let room = self.max_fragment_size - header.encoded_len(self.version);
            let (piece, tail) = rest.split_at(room.min(rest.len()));

            self.args.uncompressed_bytes_written +=
                HEADER_SIZE + header.encoded_len(self.version) + piece.len();
            if self.compresses(piece.len(), Some(header), priority) {
                self.queue_compressed(flags::DATA, Some(header), piece, priority)?;
            } else {
                self.queue_record(flags::DATA, Some(header), piece, priority)?;
            }
            rest = tail;
            first = false;
        }
        Ok(())
    }

    fn write_json(&mut self, payload: &[u8], priority: Priority) -> Result<()> {
        self.args.uncompressed_bytes_written += payload.len();
        if payload.len() <= self.max_fragment_size {
            return self.queue_json(payload, priority);
        }
        let mut framed = BytesMut::with_capacity(payload.len() + 4 * MAX_HEADER_SIZE);
        let pieces: Vec<&[u8]> = payload.chunks(self.max_fragment_size).collect();
        let last = pieces.len() - 1;
        for (i, piece) in pieces.into_iter().enumerate() {
            self.protocol
                .prepend_fragment_header(piece, i == 0, i == last, &mut framed)?;
        }
        self.enqueue(framed.freeze(), priority);
        Ok(())
    }

    fn queue_json(&mut self, text: &[u8], priority: Priority) -> Result<()> {
        let mut framed = BytesMut::with_capacity(text.len() + MAX_HEADER_SIZE);
        self.protocol.prepend_transport_header(text, &mut framed)?;
        self.enqueue(framed.freeze(), priority);
        Ok(())
    }

    /// Whether a body of `len` bytes goes through the compressor.
    ///
    /// The queues drain out of order across priorities while zlib needs records
    /// inflated in the order they were deflated, so only the first priority to
    /// compress keeps compressing. A body is also sent plain when its worst-case
    /// compressed size could outgrow a record plus one overflow record.
    fn compresses(
        &mut self,
        len: usize,
        fragment: Option<FragmentHeader>,
        priority: Priority,
    ) -> bool {
        if len < self.compression_threshold {
            return false;
        }
        let room = self.max_fragment_size - fragment.map_or(0, |f| f.encoded_len(self.version));
        if self.compressor.max_compressed_length(len) > room + self.max_fragment_size {
            trace!(len, room, "compression could overflow two records, sending plain");
            return false;
        }
        *self.compression_priority.get_or_insert(priority) == priority
    }

    /// Compress `body`; split across two records when it outgrows one.
    fn queue_compressed(
        &mut self,
        record_flags: u8,
        fragment: Option<FragmentHeader>,
        body: &[u8],
        priority: Priority,
    ) -> Result<()> {
        let mut compressed = std::mem::take(&mut self.compressed);
        compressed.clear();
        let result = self
            .compressor
            .compress(body, &mut compressed)
            .and_then(|_| {
                let room = self.max_fragment_size
                    - fragment.map_or(0, |f| f.encoded_len(self.version));
                if compressed.len() <= room {
                    self.queue_record(record_flags | flags::COMPRESSION, fragment, &compressed, priority)
                } else {
                    trace!(compressed = compressed.len(), room, "splitting compressed body");
                    let (head, tail) = compressed.split_at(room);
                    self.queue_record(
                        record_flags | flags::COMPRESSION | flags::COMP_FRAGMENT,
                        fragment,
                        head,
                        priority,
                    )?;
                    self.queue_record(flags::DATA | flags::COMPRESSION, None, tail, priority)
                }
            });
        self.compressed = compressed;
        result
    }

    fn queue_record(
        &mut self,
        record_flags: u8,
        fragment: Option<FragmentHeader>,
        body: &[u8],
        priority: Priority,
    ) -> Result<()> {
        self.record.clear();
        encode_record(record_flags, fragment, self.version, body, &mut self.record)?;
        let mut framed = BytesMut::with_capacity(self.record.len() + MAX_HEADER_SIZE);
        self.protocol
            .prepend_transport_header(&self.record, &mut framed)?;
        self.enqueue(framed.freeze(), priority);
        Ok(())
    }

    fn enqueue(&mut self, framed: Bytes, priority: Priority) {
        self.queued_bytes += framed.len();
        self.args.bytes_written += framed.len();
        self.queues[priority.index()].push_back(framed);
    }

    /// Next id for a fragmented message: wraps within the negotiated width, skips 0.
    fn allocate_fragment_id(&mut self) -> u16 {
        let id = self.next_fragment_id;
        self.next_fragment_id = match id.checked_add(1) {
            Some(next) if next <= self.version.max_fragment_id() => next,
            _ => 1,
        };
        id
    }

    fn next_queued(&mut self) -> Option<Bytes> {
        for _ in 0..self.strategy.len() {
            let priority = self.strategy[self.strategy_pos];
            self.strategy_pos = (self.strategy_pos + 1) % self.strategy.len();
            if let Some(buf) = self.queues[priority.index()].pop_front() {
                return Some(buf);
            }
        }
        // A strategy may leave a queue out entirely.
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Write queued records to the stream. Returns the bytes still queued.
    ///
    /// A stream that would block leaves the remainder queued for the next flush.
    pub fn flush(&mut self) -> Result<usize> {
        loop {
            if self.in_flight.is_none() {
                self.in_flight = self.next_queued();
            }
            let Some(buf) = self.in_flight.as_mut() else {
                break;
            };
            while buf.has_remaining() {
                match self.inner.write(buf.chunk()) {
                    Ok(0) => return Err(FrameError::ConnectionClosed),
                    Ok(n) => {
                        buf.advance(n);
                        self.queued_bytes -= n;
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        return Ok(self.queued_bytes)
                    }
                    Err(err) => return Err(FrameError::Io(err)),
                }
            }
            self.in_flight = None;
        }

        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(0),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(0),
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Send a heartbeat, or flush if data is already queued.
    pub fn ping(&mut self) -> Result<()> {
        if self.queued_bytes > 0 {
            self.flush()?;
            return Ok(());
        }
        let mut framed = BytesMut::with_capacity(MAX_HEADER_SIZE + HEADER_SIZE);
        let ping = self.protocol.ping_message();
        self.protocol.prepend_transport_header(ping, &mut framed)?;
        self.enqueue(framed.freeze(), Priority::High);
        self.flush()?;
        Ok(())
    }

    /// Answer a control frame the reader saw, such as a websocket ping.
    pub fn reply_to_control(&mut self, control: &ControlFrame) -> Result<()> {
        let mut framed = BytesMut::new();
        self.protocol.write_control_reply(control, &mut framed);
        if !framed.is_empty() {
            self.enqueue(framed.freeze(), Priority::High);
            self.flush()?;
        }
        Ok(())
    }

    /// Bytes framed but not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Byte counts for the last write.
    pub fn write_args(&self) -> WriteArgs {
        self.args
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl RecordWriter<RipcStream> {
    /// Create a writer for `RipcStream` and apply the write timeout from config.
    pub fn with_stream(
        inner: RipcStream,
        protocol: Box<dyn ProtocolFunctions>,
        version: ProtocolVersion,
        frame: &FrameConfig,
        config: WriterConfig,
    ) -> Result<Self> {
        inner
            .set_write_timeout(frame.write_timeout)
            .map_err(transport_to_frame_error)?;
        Self::with_config(inner, protocol, version, frame, config)
    }
}
