//! Read-side reassembly state machine.
//!
//! The machine owns the channel's read buffer and classifies the bytes that
//! socket reads append to it. It never performs I/O itself: the caller reads
//! into [`ReadBufferStateMachine::io_buffer_mut`], then reports the outcome
//! with [`ReadBufferStateMachine::advance_on_socket_read`]. Each time the
//! machine reaches [`ReadBufferState::KnownComplete`] exactly one message is
//! available through [`ReadBufferStateMachine::data`] until the caller calls
//! [`ReadBufferStateMachine::advance_on_application_read`].

use std::sync::Arc;

use tracing::{debug, trace};

use crate::compress::{Compressor, NoCompressor};
use crate::error::{FrameError, Result};
use crate::fragment::FragmentTable;
use crate::pool::{BufferPool, ByteBufferPair};
use crate::protocol::{ControlFrame, HeaderVerdict, ProtocolFunctions};
use crate::state::{
    CompFragmentOrigin, ReadBufferState, ReadBufferSubState, ReadResult, RecordAction,
};
use crate::websocket::{opcode, WsFrameHeader, MAX_HEADER_SIZE};
use crate::wire::{
    self, ext_flags, flags, offsets, ProtocolVersion, RipcHeader, CONTINUATION_HEADER_SIZE,
    DEFAULT_MAX_USER_MSG_SIZE, FIRST_FRAGMENT_HEADER_SIZE, HEADER_SIZE, MIN_BUFFER_CAPACITY,
    PACKED_ENTRY_HEADER_SIZE,
};

/// Extra room in the compressed-fragment scratch buffer beyond one fragment.
const SCRATCH_SLACK: usize = 100;

/// First JSON fragment reserves this multiple of its own size.
const JSON_REASSEMBLY_FACTOR: usize = 10;

/// Sizes that bound the machine's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineLimits {
    /// Largest record payload the peer may send (max user message + header).
    pub max_fragment_size: usize,
    /// Largest total a first fragment may announce.
    pub max_reassembly_size: usize,
}

impl Default for MachineLimits {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_USER_MSG_SIZE + HEADER_SIZE,
            max_reassembly_size: i32::MAX as usize,
        }
    }
}

/// Buffer the current data window points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// The read buffer itself (no copy).
    ReadIo,
    /// The decompression buffer.
    Decompress,
    /// A completed fragment reassembly.
    Fragment(u16),
    /// A completed fragmented JSON text message.
    JsonReassembly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataWindow {
    source: DataSource,
    position: usize,
    length: usize,
}

impl DataWindow {
    const EMPTY: Self = Self {
        source: DataSource::ReadIo,
        position: 0,
        length: 0,
    };
}

/// First half of a compressed body waiting for its second record.
#[derive(Debug, Default)]
enum PendingCompFragment {
    #[default]
    None,
    AwaitingSecondPart {
        origin: CompFragmentOrigin,
        scratch: ByteBufferPair,
    },
}

impl PendingCompFragment {
    fn origin(&self) -> Option<CompFragmentOrigin> {
        match self {
            Self::None => None,
            Self::AwaitingSecondPart { origin, .. } => Some(*origin),
        }
    }
}

/// Compressed bytes consumed and decompressed bytes produced so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InflateStats {
    pub compressed_in: u64,
    pub decompressed_out: u64,
}

/// Turns bytes appended to a read buffer into delimited messages.
pub struct ReadBufferStateMachine {
    pool: Arc<BufferPool>,
    limits: MachineLimits,
    version: ProtocolVersion,
    protocol: Box<dyn ProtocolFunctions>,
    compressor: Box<dyn Compressor>,
    io: ByteBufferPair,

    state: ReadBufferState,
    sub_state: ReadBufferSubState,
    msg_start: usize,
    last_read_position: usize,
    header: Option<RipcHeader>,
    is_ping: bool,
    data: DataWindow,
    packed_end: usize,

    fragments: FragmentTable,
    last_reassembled: Option<u16>,
    decompress: Option<ByteBufferPair>,
    pending: PendingCompFragment,
    json_reassembly: Option<ByteBufferPair>,
    control: Option<ControlFrame>,
    stats: InflateStats,
}

impl ReadBufferStateMachine {
    /// Create a machine over `io`, which must be empty and at least
    /// [`MIN_BUFFER_CAPACITY`] bytes.
    pub fn new(
        pool: Arc<BufferPool>,
        io: ByteBufferPair,
        protocol: Box<dyn ProtocolFunctions>,
        version: ProtocolVersion,
    ) -> Result<Self> {
        validate_io_buffer(&io)?;
        Ok(Self {
            pool,
            limits: MachineLimits::default(),
            version,
            protocol,
            compressor: Box::new(NoCompressor),
            io,
            state: ReadBufferState::NoData,
            sub_state: ReadBufferSubState::Normal,
            msg_start: 0,
            last_read_position: 0,
            header: None,
            is_ping: false,
            data: DataWindow::EMPTY,
            packed_end: 0,
            fragments: FragmentTable::new(),
            last_reassembled: None,
            decompress: None,
            pending: PendingCompFragment::None,
            json_reassembly: None,
            control: None,
            stats: InflateStats::default(),
        })
    }

    /// Set buffer limits (builder style).
    pub fn with_limits(mut self, limits: MachineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the decompressor for the negotiated compression type.
    pub fn set_compressor(&mut self, compressor: Box<dyn Compressor>) {
        self.compressor = compressor;
    }

    /// Reset for a new connection.
    ///
    /// Every reassembly, scratch and decompression buffer goes back to the
    /// pool. `io` must be empty and at least [`MIN_BUFFER_CAPACITY`] bytes.
    pub fn initialize(
        &mut self,
        io: ByteBufferPair,
        protocol: Box<dyn ProtocolFunctions>,
        version: ProtocolVersion,
    ) -> Result<()> {
        validate_io_buffer(&io)?;
        self.release_buffers();

        let old = std::mem::replace(&mut self.io, io);
        self.pool.release(old);
        self.protocol = protocol;
        self.version = version;
        self.state = ReadBufferState::NoData;
        self.sub_state = ReadBufferSubState::Normal;
        self.msg_start = 0;
        self.last_read_position = 0;
        self.header = None;
        self.is_ping = false;
        self.data = DataWindow::EMPTY;
        self.packed_end = 0;
        self.control = None;
        self.stats = InflateStats::default();
        Ok(())
    }

    pub fn state(&self) -> ReadBufferState {
        self.state
    }

    pub fn sub_state(&self) -> ReadBufferSubState {
        self.sub_state
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn limits(&self) -> &MachineLimits {
        &self.limits
    }

    pub fn protocol(&self) -> &dyn ProtocolFunctions {
        self.protocol.as_ref()
    }

    pub fn io_buffer(&self) -> &ByteBufferPair {
        &self.io
    }

    /// The read buffer, for socket reads into [`ByteBufferPair::spare_mut`].
    pub fn io_buffer_mut(&mut self) -> &mut ByteBufferPair {
        &mut self.io
    }

    /// Offset of the current record in the read buffer.
    pub fn current_message_start(&self) -> usize {
        self.msg_start
    }

    /// On-wire length of the current record, 0 while unknown.
    pub fn current_message_length(&self) -> usize {
        self.protocol.message_length()
    }

    /// Read-buffer position right after the last socket read.
    pub fn last_read_position(&self) -> usize {
        self.last_read_position
    }

    /// The current record is a heartbeat.
    pub fn is_ping(&self) -> bool {
        self.state == ReadBufferState::KnownComplete && self.is_ping
    }

    pub fn data_source(&self) -> DataSource {
        self.data.source
    }

    pub fn data_position(&self) -> usize {
        self.data.position
    }

    pub fn data_length(&self) -> usize {
        self.data.length
    }

    /// The message delimited by the last transition to `KnownComplete`.
    pub fn data(&self) -> &[u8] {
        let DataWindow {
            source,
            position,
            length,
        } = self.data;
        let empty: &[u8] = &[];
        match source {
            DataSource::ReadIo => self.io.window(position, length),
            DataSource::Decompress => self
                .decompress
                .as_ref()
                .map_or(empty, |buf| buf.window(position, length)),
            DataSource::Fragment(id) => self
                .fragments
                .get(id)
                .map_or(empty, |buf| buf.window(position, length)),
            DataSource::JsonReassembly => self
                .json_reassembly
                .as_ref()
                .map_or(empty, |buf| buf.window(position, length)),
        }
    }

    /// Whether the current packed record holds entries not yet handed out.
    pub fn has_remaining_packed_data(&self) -> bool {
        matches!(
            self.sub_state,
            ReadBufferSubState::ProcessingPacked | ReadBufferSubState::ProcessingPackedCompressed
        ) && self.data.position + self.data.length != self.packed_end
    }

    /// Fragment reassemblies in progress.
    pub fn fragments_in_progress(&self) -> usize {
        self.fragments.len()
    }

    /// A compressed first half is waiting for its second record.
    pub fn is_awaiting_comp_fragment(&self) -> bool {
        !matches!(self.pending, PendingCompFragment::None)
    }

    pub fn inflate_stats(&self) -> InflateStats {
        self.stats
    }

    /// Control frame seen since the last call, e.g. a ping owed a pong.
    pub fn take_control_frame(&mut self) -> Option<ControlFrame> {
        self.control.take()
    }

    /// Report the outcome of a socket read into the read buffer.
    ///
    /// The caller has already advanced the read buffer's cursor by the number
    /// of bytes read. Only `NoData` and the `*Incomplete` states accept new
    /// bytes; `*Insufficient` states need [`Self::advance_on_compact`] first.
    pub fn advance_on_socket_read(&mut self, result: ReadResult) -> Result<ReadBufferState> {
        self.last_read_position = self.io.position();
        match result {
            ReadResult::EndOfStream => {
                debug!(msg_start = self.msg_start, "end of stream");
                self.state = ReadBufferState::EndOfStream;
            }
            ReadResult::Bytes(0) => {}
            ReadResult::Bytes(_) => match self.state {
                ReadBufferState::KnownIncomplete => self.update_len_known()?,
                ReadBufferState::UnknownIncomplete | ReadBufferState::NoData => {
                    self.update_len_unknown()?
                }
                state => {
                    return Err(FrameError::ContractViolation {
                        operation: "advance_on_socket_read",
                        state,
                    })
                }
            },
        }
        Ok(self.state)
    }

    /// Append `bytes` to the read buffer and advance as if a socket read
    /// had delivered them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<ReadBufferState> {
        if !self.io.try_append(bytes) {
            return Err(FrameError::InvalidArgument(format!(
                "{} bytes do not fit in the {} bytes left in the read buffer",
                bytes.len(),
                self.io.remaining()
            )));
        }
        self.advance_on_socket_read(ReadResult::Bytes(bytes.len()))
    }

    /// Account for the caller having moved the current record to offset 0.
    ///
    /// Must be called right after compacting, never before.
    pub fn advance_on_compact(&mut self) -> ReadBufferState {
        self.msg_start = 0;
        self.state = match self.state {
            ReadBufferState::KnownInsufficient => ReadBufferState::KnownIncomplete,
            ReadBufferState::UnknownInsufficient => ReadBufferState::UnknownIncomplete,
            other => other,
        };
        self.state
    }

    /// Compact the read buffer from the current record and advance.
    ///
    /// A record that already starts at offset 0 cannot move down; the read
    /// buffer is swapped for a larger one from the pool instead, bounded by
    /// the largest record the peer may send plus outer framing.
    pub fn compact(&mut self) -> Result<ReadBufferState> {
        if !self.state.is_insufficient() {
            return Err(FrameError::ContractViolation {
                operation: "compact",
                state: self.state,
            });
        }
        if self.msg_start == 0 {
            self.grow_read_buffer()?;
            return Ok(self.advance_on_compact());
        }
        trace!(from = self.msg_start, kept = self.io.position() - self.msg_start, "compacting read buffer");
        self.io.compact_from(self.msg_start);
        Ok(self.advance_on_compact())
    }

    /// Move past the message the application just consumed.
    ///
    /// Inside a packed record this steps to the next entry and stays
    /// `KnownComplete`. Otherwise the record is finished: with nothing left in
    /// the read buffer the buffer is rewound to offset 0 and the state becomes
    /// `NoData`; with bytes left the next record is parsed in place.
    pub fn advance_on_application_read(&mut self) -> Result<ReadBufferState> {
        if self.state != ReadBufferState::KnownComplete {
            return Err(FrameError::ContractViolation {
                operation: "advance_on_application_read",
                state: self.state,
            });
        }
        let calc_end = self.msg_start + self.protocol.message_length();

        match self.sub_state {
            ReadBufferSubState::ProcessingPacked | ReadBufferSubState::ProcessingPackedCompressed => {
                if self.data.position != self.packed_end {
                    self.advance_to_next_packed()?;
                    if self.data.position != self.packed_end {
                        return Ok(self.state);
                    }
                }
            }
            ReadBufferSubState::ProcessingCompleteFragmented => {
                if let Some(id) = self.last_reassembled.take() {
                    if let Some(done) = self.fragments.take(id) {
                        self.pool.release(done);
                    }
                }
            }
            ReadBufferSubState::ProcessingCompleteFragmentedJson => {
                if let Some(done) = self.json_reassembly.take() {
                    self.pool.release(done);
                }
            }
            _ => {}
        }

        self.header = None;
        self.is_ping = false;
        self.data = DataWindow::EMPTY;
        self.protocol.unset_message_length();

        if calc_end >= self.io.position() {
            self.msg_start = 0;
            self.io.set_position(0);
            self.state = ReadBufferState::NoData;
        } else {
            self.msg_start = calc_end;
            self.update_len_unknown()?;
        }
        Ok(self.state)
    }

    fn update_len_unknown(&mut self) -> Result<()> {
        loop {
            match self
                .protocol
                .read_prepend_transport_header(&mut self.io, self.msg_start)?
            {
                HeaderVerdict::Ready => break,
                HeaderVerdict::NeedMore(state) => {
                    self.state = state;
                    return Ok(());
                }
                HeaderVerdict::Control(frame) => {
                    if !self.handle_control(frame) {
                        return Ok(());
                    }
                }
            }
        }

        if !self.protocol.is_rwf_protocol() {
            return self.complete_json_frame();
        }

        let header_at = self.msg_start + self.protocol.additional_header_length();
        if header_at + HEADER_SIZE <= self.io.position() {
            let header = RipcHeader::decode(self.io.window(header_at, HEADER_SIZE))
                .ok_or(FrameError::MalformedHeader("truncated record header"))?;
            if header.length < HEADER_SIZE {
                return Err(FrameError::MalformedHeader("record shorter than its header"));
            }
            if let Some(frame) = self.protocol.frame_header() {
                if frame.payload_len != header.length {
                    return Err(FrameError::MalformedHeader(
                        "websocket frame and record lengths disagree",
                    ));
                }
            }
            self.header = Some(header);
            self.protocol.set_ripc_length(header.length);
            self.update_len_known()
        } else {
            self.state = if header_at + HEADER_SIZE <= self.io.limit() {
                ReadBufferState::UnknownIncomplete
            } else {
                ReadBufferState::UnknownInsufficient
            };
            Ok(())
        }
    }

    fn update_len_known(&mut self) -> Result<()> {
        let Some(header) = self.header else {
            // JSON frames carry no record header; re-parse the outer frame.
            return self.update_len_unknown();
        };

        let calc_end = self.msg_start + self.protocol.message_length();
        if calc_end <= self.io.position() {
            self.state = ReadBufferState::KnownComplete;
            self.complete_record(header, calc_end)
        } else {
            self.state = if calc_end <= self.io.limit() {
                ReadBufferState::KnownIncomplete
            } else {
                ReadBufferState::KnownInsufficient
            };
            Ok(())
        }
    }

    /// Returns true when parsing should continue at the next frame.
    fn handle_control(&mut self, frame: ControlFrame) -> bool {
        match frame {
            ControlFrame::Close(code) => {
                debug!(?code, "peer sent websocket close");
                self.control = Some(ControlFrame::Close(code));
                self.state = ReadBufferState::EndOfStream;
                false
            }
            ControlFrame::Ping(_) | ControlFrame::Pong => {
                if matches!(frame, ControlFrame::Ping(_)) {
                    self.control = Some(frame);
                }
                self.sub_state = ReadBufferSubState::Normal;

                if !self.protocol.is_rwf_protocol() {
                    let frame_end = self.msg_start + self.protocol.message_length();
                    self.state = ReadBufferState::KnownComplete;
                    self.is_ping = true;
                    self.data = DataWindow {
                        source: DataSource::ReadIo,
                        position: frame_end,
                        length: 0,
                    };
                    return false;
                }

                let frame_end = self.msg_start + self.protocol.message_length();
                self.protocol.unset_message_length();
                if frame_end >= self.io.position() {
                    self.msg_start = 0;
                    self.io.set_position(0);
                    self.state = ReadBufferState::NoData;
                    false
                } else {
                    self.msg_start = frame_end;
                    true
                }
            }
        }
    }

    fn complete_record(&mut self, header: RipcHeader, calc_end: usize) -> Result<()> {
        let action = RecordAction::classify(&header, self.pending.origin())?;
        self.sub_state = action.sub_state();
        self.is_ping = false;

        let body_start = self.msg_start + self.protocol.entire_header_length();
        let body_len = calc_end.saturating_sub(body_start);
        trace!(?action, length = header.length, msg_start = self.msg_start, "record complete");

        match action {
            RecordAction::Ping => {
                self.is_ping = true;
                self.set_data(DataSource::ReadIo, calc_end, 0);
            }
            RecordAction::Plain => self.set_data(DataSource::ReadIo, body_start, body_len),
            RecordAction::Compressed => {
                let n = self.inflate_read_io(body_start, body_len)?;
                self.set_data(DataSource::Decompress, 0, n);
            }
            RecordAction::Packed => {
                self.packed_end = calc_end;
                self.set_data(DataSource::ReadIo, body_start, 0);
                self.advance_to_next_packed()?;
            }
            RecordAction::PackedCompressed => {
                let n = self.inflate_read_io(body_start, body_len)?;
                self.packed_end = n;
                self.set_data(DataSource::Decompress, 0, 0);
                self.advance_to_next_packed()?;
            }
            RecordAction::PackedCompFragmentFirst => {
                self.stash_first_half(CompFragmentOrigin::Packed, body_start, body_len)?;
                self.packed_end = calc_end;
                self.set_data(DataSource::ReadIo, calc_end, 0);
            }
            RecordAction::CompFragmentFirst => {
                self.stash_first_half(CompFragmentOrigin::Standalone, body_start, body_len)?;
                self.set_data(DataSource::ReadIo, calc_end, 0);
            }
            RecordAction::CompFragmentSecond(origin) => {
                let n = self.finish_comp_fragment(body_start, body_len)?;
                match origin {
                    CompFragmentOrigin::Standalone => self.set_data(DataSource::Decompress, 0, n),
                    CompFragmentOrigin::Packed => {
                        self.packed_end = n;
                        self.set_data(DataSource::Decompress, 0, 0);
                        self.advance_to_next_packed()?;
                    }
                    CompFragmentOrigin::Fragment(id) => {
                        if let Some(inflated) = &self.decompress {
                            self.fragments.append(id, inflated.window(0, n))?;
                        }
                        self.update_fragment_handler(id, calc_end);
                    }
                }
            }
            RecordAction::Fragmented { compressed } => {
                self.process_extended(header, calc_end, compressed)?;
            }
        }
        Ok(())
    }

    fn process_extended(&mut self, header: RipcHeader, calc_end: usize, compressed: bool) -> Result<()> {
        let record = self.msg_start + self.protocol.additional_header_length();
        let width = self.version.fragment_id_width();
        let src = self.io.as_slice();

        if record + offsets::EXTENDED_FLAGS >= calc_end {
            return Err(FrameError::MalformedHeader("missing extended flags"));
        }
        let extended = src[record + offsets::EXTENDED_FLAGS];

        let (fragment_id, data_start) = if extended & ext_flags::FRAGMENT_HEADER != 0 {
            let data_start = record + FIRST_FRAGMENT_HEADER_SIZE + width;
            if data_start > calc_end {
                return Err(FrameError::MalformedHeader("truncated first-fragment header"));
            }
            let total = wire::read_u32(src, record + offsets::FRAGMENTED_MSG_LENGTH);
            let id = wire::read_fragment_id(src, record + offsets::FRAGMENT_HEADER_FRAGMENT_ID, width);
            debug!(fragment_id = id, total_len = total, "first fragment");
            self.fragments.begin(
                &self.pool,
                id,
                u64::from(total),
                self.limits.max_reassembly_size,
            )?;
            (id, data_start)
        } else if extended & ext_flags::FRAGMENT != 0 {
            let data_start = record + CONTINUATION_HEADER_SIZE + width;
            if data_start > calc_end {
                return Err(FrameError::MalformedHeader("truncated continuation header"));
            }
            (wire::read_fragment_id(src, record + offsets::FRAGMENT_ID, width), data_start)
        } else {
            return Err(FrameError::MalformedHeader(
                "optional flags without a fragment header",
            ));
        };

        let data_len = calc_end - data_start;
        if !compressed {
            self.fragments
                .append(fragment_id, self.io.window(data_start, data_len))?;
        } else if header.has(flags::COMP_FRAGMENT) {
            self.stash_first_half(CompFragmentOrigin::Fragment(fragment_id), data_start, data_len)?;
        } else {
            let n = self.inflate_read_io(data_start, data_len)?;
            if let Some(inflated) = &self.decompress {
                self.fragments.append(fragment_id, inflated.window(0, n))?;
            }
        }

        self.update_fragment_handler(fragment_id, calc_end);
        Ok(())
    }

    fn update_fragment_handler(&mut self, fragment_id: u16, calc_end: usize) {
        match self.fragments.get(fragment_id) {
            Some(entry) if entry.is_full() => {
                let length = entry.limit();
                debug!(fragment_id, length, "reassembly complete");
                self.last_reassembled = Some(fragment_id);
                self.set_data(DataSource::Fragment(fragment_id), 0, length);
                self.sub_state = ReadBufferSubState::ProcessingCompleteFragmented;
            }
            _ => self.set_data(DataSource::ReadIo, calc_end, 0),
        }
    }

    /// Step the data window to the next non-empty packed entry, or to the
    /// end of the packed region.
    fn advance_to_next_packed(&mut self) -> Result<()> {
        let source = self.data.source;
        let end = self.packed_end;
        let mut at = self.data.position + self.data.length;

        loop {
            if at >= end {
                self.set_data(source, end, 0);
                return Ok(());
            }
            let region = match source {
                DataSource::Decompress => self
                    .decompress
                    .as_ref()
                    .map_or(&[][..], ByteBufferPair::written),
                _ => self.io.written(),
            };
            if at + PACKED_ENTRY_HEADER_SIZE > end || end > region.len() {
                return Err(FrameError::MalformedHeader("truncated packed entry length"));
            }
            let len = usize::from(wire::read_u16(region, at));
            at += PACKED_ENTRY_HEADER_SIZE;
            if at + len > end {
                return Err(FrameError::MalformedHeader("packed entry overruns its record"));
            }
            // A zero-length entry does not end the pack: entries after it
            // are still delivered, so `[10, 0, 7]` yields two windows.
            if len > 0 {
                self.set_data(source, at, len);
                return Ok(());
            }
        }
    }

    fn complete_json_frame(&mut self) -> Result<()> {
        let frame: WsFrameHeader = *self
            .protocol
            .frame_header()
            .ok_or(FrameError::MalformedHeader("json payload without an outer frame"))?;

        self.state = ReadBufferState::KnownComplete;
        self.sub_state = ReadBufferSubState::Normal;
        self.is_ping = false;

        let payload_start = self.msg_start + frame.header_len;
        if frame.compressed {
            let n = self.inflate_read_io(payload_start, frame.payload_len)?;
            self.set_data(DataSource::Decompress, 0, n);
        } else {
            self.set_data(DataSource::ReadIo, payload_start, frame.payload_len);
        }

        let first = !frame.fin && frame.opcode != opcode::CONTINUATION;
        let continuation = frame.opcode == opcode::CONTINUATION;
        if !first && !continuation {
            return Ok(());
        }

        let piece_len = self.data.length;
        let mut buf = match self.json_reassembly.take() {
            Some(stale) if first => {
                debug!("new fragmented json message replaces an unfinished one");
                self.pool.release(stale);
                self.pool
                    .acquire((piece_len * JSON_REASSEMBLY_FACTOR).max(MIN_BUFFER_CAPACITY))?
            }
            Some(buf) => buf,
            None if first => self
                .pool
                .acquire((piece_len * JSON_REASSEMBLY_FACTOR).max(MIN_BUFFER_CAPACITY))?,
            None => {
                debug!("json continuation without a first fragment dropped");
                self.set_data(DataSource::ReadIo, payload_start + frame.payload_len, 0);
                return Ok(());
            }
        };

        if buf.remaining() < piece_len {
            let grown = (buf.capacity() * 2).max(buf.position() + piece_len);
            let mut bigger = self.pool.acquire(grown)?;
            bigger.try_append(buf.written());
            self.pool.release(std::mem::replace(&mut buf, bigger));
        }
        let piece = match self.data.source {
            DataSource::Decompress => self
                .decompress
                .as_ref()
                .map_or(&[][..], |b| b.window(0, piece_len)),
            _ => self.io.window(payload_start, piece_len),
        };
        buf.try_append(piece);

        if frame.fin {
            let length = buf.position();
            self.json_reassembly = Some(buf);
            self.set_data(DataSource::JsonReassembly, 0, length);
            self.sub_state = ReadBufferSubState::ProcessingCompleteFragmentedJson;
        } else {
            self.json_reassembly = Some(buf);
            self.set_data(DataSource::ReadIo, payload_start + frame.payload_len, 0);
            self.sub_state = ReadBufferSubState::ProcessingFragmented;
        }
        Ok(())
    }

    /// Copy a compressed first half into scratch and wait for the second.
    fn stash_first_half(
        &mut self,
        origin: CompFragmentOrigin,
        start: usize,
        len: usize,
    ) -> Result<()> {
        let mut scratch = match std::mem::take(&mut self.pending) {
            PendingCompFragment::AwaitingSecondPart {
                origin: stale,
                mut scratch,
            } => {
                debug!(?stale, "compressed first half replaced before its second part");
                scratch.clear();
                scratch
            }
            PendingCompFragment::None => self.pool.acquire(
                (self.limits.max_fragment_size + SCRATCH_SLACK).max(len * 2),
            )?,
        };
        if scratch.capacity() < len {
            self.pool.release(scratch);
            scratch = self.pool.acquire(len * 2)?;
        }
        scratch.try_append(self.io.window(start, len));
        self.pending = PendingCompFragment::AwaitingSecondPart { origin, scratch };
        Ok(())
    }

    /// Join the second half onto the stashed first and decompress once.
    fn finish_comp_fragment(&mut self, start: usize, len: usize) -> Result<usize> {
        let PendingCompFragment::AwaitingSecondPart { mut scratch, .. } =
            std::mem::take(&mut self.pending)
        else {
            return Err(FrameError::ContractViolation {
                operation: "finish_comp_fragment",
                state: self.state,
            });
        };

        if scratch.remaining() < len {
            let mut bigger = self.pool.acquire(scratch.position() + len)?;
            bigger.try_append(scratch.written());
            self.pool.release(std::mem::replace(&mut scratch, bigger));
        }
        scratch.try_append(self.io.window(start, len));

        let result = inflate(
            self.compressor.as_mut(),
            &self.pool,
            &mut self.decompress,
            self.limits.max_fragment_size,
            scratch.written(),
        );
        let joined = scratch.position() as u64;
        self.pool.release(scratch);

        let n = result?;
        self.stats.compressed_in += joined;
        self.stats.decompressed_out += n as u64;
        Ok(n)
    }

    fn inflate_read_io(&mut self, start: usize, len: usize) -> Result<usize> {
        let n = inflate(
            self.compressor.as_mut(),
            &self.pool,
            &mut self.decompress,
            self.limits.max_fragment_size,
            self.io.window(start, len),
        )?;
        self.stats.compressed_in += len as u64;
        self.stats.decompressed_out += n as u64;
        Ok(n)
    }

    fn set_data(&mut self, source: DataSource, position: usize, length: usize) {
        self.data = DataWindow {
            source,
            position,
            length,
        };
    }

    fn grow_read_buffer(&mut self) -> Result<()> {
        let capacity = self.io.capacity();
        let ceiling = self.limits.max_fragment_size + MAX_HEADER_SIZE;
        let needed = self.protocol.message_length();
        if needed > ceiling || capacity >= ceiling {
            return Err(FrameError::PayloadTooLarge {
                size: needed.max(capacity + 1),
                max: ceiling.max(capacity),
            });
        }

        let target = if needed > capacity {
            needed
        } else {
            (capacity * 2).min(ceiling)
        };
        let mut bigger = self.pool.acquire(target)?;
        if !bigger.try_append(self.io.written()) {
            self.pool.release(bigger);
            return Err(FrameError::PayloadTooLarge {
                size: self.io.position(),
                max: target,
            });
        }
        debug!(from = capacity, to = bigger.capacity(), needed, "growing read buffer");
        let old = std::mem::replace(&mut self.io, bigger);
        self.pool.release(old);
        Ok(())
    }

    fn release_buffers(&mut self) {
        self.fragments.clear(&self.pool);
        self.last_reassembled = None;
        if let Some(buf) = self.decompress.take() {
            self.pool.release(buf);
        }
        if let PendingCompFragment::AwaitingSecondPart { scratch, .. } =
            std::mem::take(&mut self.pending)
        {
            self.pool.release(scratch);
        }
        if let Some(buf) = self.json_reassembly.take() {
            self.pool.release(buf);
        }
    }
}

impl Drop for ReadBufferStateMachine {
    fn drop(&mut self) {
        self.release_buffers();
    }
}

impl std::fmt::Debug for ReadBufferStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBufferStateMachine")
            .field("state", &self.state)
            .field("sub_state", &self.sub_state)
            .field("msg_start", &self.msg_start)
            .field("version", &self.version)
            .field("transport", &self.protocol.transport())
            .field("fragments_in_progress", &self.fragments.len())
            .finish()
    }
}

fn validate_io_buffer(io: &ByteBufferPair) -> Result<()> {
    if io.capacity() < MIN_BUFFER_CAPACITY {
        return Err(FrameError::InvalidArgument(format!(
            "read buffer capacity {} is below the minimum of {MIN_BUFFER_CAPACITY}",
            io.capacity()
        )));
    }
    if io.position() != 0 {
        return Err(FrameError::InvalidArgument(
            "read buffer must be empty".to_string(),
        ));
    }
    Ok(())
}

/// Decompress `src` into the (lazily acquired) decompression buffer.
fn inflate(
    compressor: &mut dyn Compressor,
    pool: &BufferPool,
    slot: &mut Option<ByteBufferPair>,
    min_capacity: usize,
    src: &[u8],
) -> Result<usize> {
    let buf = match slot {
        Some(buf) => buf,
        None => slot.insert(pool.acquire(min_capacity)?),
    };
    buf.clear();
    let n = compressor.decompress(src, buf.as_mut_slice())?;
    buf.set_position(n);
    Ok(n)
}
