use std::io::{ErrorKind, Read};
use std::sync::Arc;

use ripc_transport::RipcStream;
use tracing::trace;

use crate::codec::FrameConfig;
use crate::compress::Compressor;
use crate::error::{FrameError, Result};
use crate::machine::{MachineLimits, ReadBufferStateMachine};
use crate::pool::BufferPool;
use crate::protocol::{ControlFrame, ProtocolFunctions};
use crate::state::{ReadBufferState, ReadResult};
use crate::wire::{ProtocolVersion, HEADER_SIZE};

/// Outcome of one [`RecordReader::read`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<'a> {
    /// One complete message, valid until the next read.
    Message(&'a [u8]),
    /// The peer's heartbeat.
    Ping,
    /// Nothing buffered; wait for the socket to become readable.
    WouldBlock,
    /// Part of a record has arrived; this many bytes are buffered.
    Pending(usize),
}

/// Byte counts for the last [`RecordReader::read`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadArgs {
    /// Bytes taken off the socket.
    pub bytes_read: usize,
    /// The same bytes with compressed bodies counted at their inflated size.
    pub uncompressed_bytes_read: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Message,
    Ping,
    WouldBlock,
    Pending(usize),
}

/// Reads delimited messages from any `Read` stream.
///
/// Each call performs at most one socket read; messages already sitting in
/// the read buffer are handed out without touching the stream.
pub struct RecordReader<T> {
    inner: T,
    machine: ReadBufferStateMachine,
    args: ReadArgs,
    // Set when the machine reached KnownComplete outside `step`.
    undelivered: bool,
}

impl<T: Read> RecordReader<T> {
    /// Create a reader with a read buffer from `pool`.
    pub fn new(
        inner: T,
        pool: Arc<BufferPool>,
        config: &FrameConfig,
        protocol: Box<dyn ProtocolFunctions>,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let io = pool.acquire(config.read_buffer_capacity)?;
        let limits = MachineLimits {
            max_fragment_size: config.max_fragment_size() + HEADER_SIZE,
            max_reassembly_size: config.max_reassembly_size,
        };
        let machine = ReadBufferStateMachine::new(pool, io, protocol, version)?.with_limits(limits);
        Ok(Self::from_machine(inner, machine))
    }

    /// Wrap a machine that is already initialized.
    pub fn from_machine(inner: T, machine: ReadBufferStateMachine) -> Self {
        Self {
            inner,
            machine,
            args: ReadArgs::default(),
            undelivered: false,
        }
    }

    /// Hand bytes already taken off the stream (e.g. read past a handshake
    /// reply) to the machine before the first socket read.
    pub fn preload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.machine.feed(bytes)?;
        self.undelivered = self.machine.state() == ReadBufferState::KnownComplete;
        Ok(())
    }

    /// Set the decompressor negotiated for the connection.
    pub fn set_compressor(&mut self, compressor: Box<dyn Compressor>) {
        self.machine.set_compressor(compressor);
    }

    /// Read the next message, performing at most one socket read.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` once the peer has closed.
    pub fn read(&mut self) -> Result<ReadOutcome<'_>> {
        Ok(match self.step()? {
            Step::Message => ReadOutcome::Message(self.machine.data()),
            Step::Ping => ReadOutcome::Ping,
            Step::WouldBlock => ReadOutcome::WouldBlock,
            Step::Pending(n) => ReadOutcome::Pending(n),
        })
    }

    /// Read until a message arrives, skipping pings (blocking).
    pub fn read_message(&mut self) -> Result<&[u8]> {
        loop {
            if self.step()? == Step::Message {
                return Ok(self.machine.data());
            }
        }
    }

    fn step(&mut self) -> Result<Step> {
        self.args = ReadArgs::default();
        let before = self.machine.inflate_stats();

        if self.machine.state() == ReadBufferState::KnownComplete && !self.undelivered {
            self.machine.advance_on_application_read()?;
        }
        self.undelivered = false;
        if self.machine.state() != ReadBufferState::KnownComplete {
            self.perform_read_io()?;
        }

        let after = self.machine.inflate_stats();
        let inflated = (after.decompressed_out - before.decompressed_out) as usize;
        let deflated = (after.compressed_in - before.compressed_in) as usize;
        self.args.uncompressed_bytes_read = (self.args.bytes_read + inflated).saturating_sub(deflated);

        let step = match self.machine.state() {
            ReadBufferState::KnownComplete if self.machine.is_ping() => Step::Ping,
            ReadBufferState::KnownComplete if self.machine.data_length() != 0 => Step::Message,
            ReadBufferState::KnownComplete | ReadBufferState::NoData => Step::WouldBlock,
            ReadBufferState::EndOfStream => return Err(FrameError::ConnectionClosed),
            _ => Step::Pending(
                self.machine.io_buffer().position() - self.machine.current_message_start(),
            ),
        };
        Ok(step)
    }

    fn perform_read_io(&mut self) -> Result<()> {
        match self.machine.state() {
            ReadBufferState::EndOfStream => return Ok(()),
            state if state.is_insufficient() => {
                self.machine.compact()?;
            }
            _ => {}
        }

        let io = self.machine.io_buffer_mut();
        let result = loop {
            match self.inner.read(io.spare_mut()) {
                Ok(0) => break ReadResult::EndOfStream,
                Ok(n) => {
                    io.advance(n);
                    break ReadResult::Bytes(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    return Ok(())
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        };

        if let ReadResult::Bytes(n) = result {
            self.args.bytes_read = n;
            trace!(bytes = n, state = ?self.machine.state(), "socket read");
        }
        self.machine.advance_on_socket_read(result)?;
        Ok(())
    }

    /// Byte counts for the last read.
    pub fn read_args(&self) -> ReadArgs {
        self.args
    }

    /// Whether more bytes than the current message are buffered.
    pub fn has_buffered_data(&self) -> bool {
        let end = self.machine.current_message_start() + self.machine.current_message_length();
        self.machine.has_remaining_packed_data() || self.machine.io_buffer().position() > end
    }

    /// Control frame the peer sent, for the write side to answer.
    pub fn take_control_frame(&mut self) -> Option<ControlFrame> {
        self.machine.take_control_frame()
    }

    pub fn machine(&self) -> &ReadBufferStateMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut ReadBufferStateMachine {
        &mut self.machine
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl RecordReader<RipcStream> {
    /// Create a reader for `RipcStream` and apply the read timeout from config.
    pub fn with_stream(
        inner: RipcStream,
        pool: Arc<BufferPool>,
        config: &FrameConfig,
        protocol: Box<dyn ProtocolFunctions>,
        version: ProtocolVersion,
    ) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Self::new(inner, pool, config, protocol, version)
    }
}

pub(crate) fn transport_to_frame_error(err: ripc_transport::TransportError) -> FrameError {
    match err {
        ripc_transport::TransportError::Io(io) | ripc_transport::TransportError::Accept(io) => {
            FrameError::Io(io)
        }
        ripc_transport::TransportError::Connect { source, .. }
        | ripc_transport::TransportError::Bind { source, .. }
        | ripc_transport::TransportError::SocketOption { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
