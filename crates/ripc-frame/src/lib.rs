//! RIPC record framing.
//!
//! Every message on the wire travels in a record:
//! - A 2-byte big-endian length that includes the header itself
//! - A 1-byte flags field (data, compression, packing, fragmentation)
//! - An optional fragment header for messages larger than one record
//!
//! The read side is a reassembly state machine that owns the channel's read
//! buffer and hands out one message per `KnownComplete` transition. It never
//! performs I/O itself; [`RecordReader`] drives it from any `Read`. The write
//! side ([`RecordWriter`]) packs, compresses, fragments and queues records by
//! priority. Records may also travel inside WebSocket frames, carrying RWF
//! records or JSON text.

pub mod codec;
pub mod compress;
pub mod error;
pub mod fragment;
pub mod machine;
pub mod pool;
pub mod protocol;
pub mod reader;
pub mod state;
pub mod websocket;
pub mod wire;
pub mod writer;

pub use codec::{
    encode_packed, encode_ping, encode_plain, encode_record, FragmentHeader, FrameConfig,
    DEFAULT_READ_BUFFER_CAPACITY,
};
pub use compress::{compressor_for, CompressionType, Compressor};
pub use error::{FrameError, Result};
pub use machine::{DataSource, InflateStats, MachineLimits, ReadBufferStateMachine};
pub use pool::{BufferPool, ByteBufferPair, PoolConfig, PoolStats};
pub use protocol::{protocol_for, ControlFrame, ProtocolFunctions, TransportProtocol};
pub use reader::{ReadOutcome, RecordReader};
pub use state::{ReadBufferState, ReadBufferSubState, ReadResult};
pub use websocket::{Role, WsMode};
pub use wire::{ProtocolVersion, RipcHeader, HEADER_SIZE, MAX_RECORD_SIZE};
pub use writer::{Priority, RecordWriter, WriteBuffer, WriterConfig};
