use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use ripc_frame::websocket::MAX_HEADER_SIZE;
use ripc_frame::wire::FIRST_FRAGMENT_HEADER_SIZE;
use ripc_frame::{
    compressor_for, protocol_for, BufferPool, CompressionType, FrameConfig, FrameError,
    ReadOutcome, RecordReader,
};

use crate::cmd::{parse_version, DecodeArgs};
use crate::exit::{frame_error, io_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub messages: usize,
    pub pings: usize,
    pub bytes_read: usize,
    pub uncompressed_bytes_read: usize,
    /// The capture ends inside a record.
    pub truncated: bool,
}

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let file = File::open(&args.file)
        .map_err(|err| io_error(&format!("failed opening {}", args.file.display()), err))?;
    let source = args.file.display().to_string();

    let summary = decode_stream(BufReader::new(file), &args, |index, message| {
        print_message(index, message, &source, format);
    })
    .map_err(|err| frame_error("decode failed", err))?;

    tracing::info!(
        messages = summary.messages,
        pings = summary.pings,
        bytes = summary.bytes_read,
        uncompressed = summary.uncompressed_bytes_read,
        "capture decoded"
    );
    if summary.truncated {
        tracing::warn!("capture ends inside a record");
    }
    Ok(SUCCESS)
}

/// Run `stream` through the read machine, handing each message to `emit`.
pub fn decode_stream<R, F>(
    stream: R,
    args: &DecodeArgs,
    mut emit: F,
) -> Result<DecodeSummary, FrameError>
where
    R: std::io::Read,
    F: FnMut(usize, &[u8]),
{
    let version = parse_version(args.protocol_version)
        .map_err(|err| FrameError::InvalidArgument(err.message))?;
    let mut frame = FrameConfig::default();
    if let Some(size) = args.max_msg_size {
        frame = frame.with_max_user_msg_size(size);
    }
    let record_ceiling =
        frame.max_user_msg_size + FIRST_FRAGMENT_HEADER_SIZE + 2 + MAX_HEADER_SIZE;
    let capacity = frame.read_buffer_capacity.max(record_ceiling);
    let frame = frame.with_read_buffer_capacity(capacity);

    let mut reader = RecordReader::new(
        stream,
        Arc::new(BufferPool::default()),
        &frame,
        protocol_for(args.transport.into(), args.role.into()),
        version,
    )?;
    let compression = CompressionType::from(args.compression);
    reader.set_compressor(compressor_for(compression, 6));

    let mut summary = DecodeSummary::default();
    loop {
        if args.count.is_some_and(|count| summary.messages >= count) {
            break;
        }
        let outcome = reader.read();
        let delivered = match outcome {
            Ok(ReadOutcome::Message(message)) => {
                summary.messages += 1;
                emit(summary.messages, message);
                true
            }
            Ok(ReadOutcome::Ping) => {
                summary.pings += 1;
                true
            }
            Ok(ReadOutcome::WouldBlock | ReadOutcome::Pending(_)) => true,
            Err(FrameError::ConnectionClosed) => false,
            Err(err) => return Err(err),
        };
        let args_read = reader.read_args();
        summary.bytes_read += args_read.bytes_read;
        summary.uncompressed_bytes_read += args_read.uncompressed_bytes_read;
        if let Some(frame) = reader.take_control_frame() {
            tracing::debug!(?frame, "control frame in capture");
        }
        if !delivered {
            let machine = reader.machine();
            summary.truncated = machine.io_buffer().position() > machine.current_message_start();
            break;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;
    use ripc_frame::{encode_packed, encode_ping, encode_plain};

    use super::*;
    use crate::cmd::{CompressionArg, RoleArg, TransportArg};

    fn args() -> DecodeArgs {
        DecodeArgs {
            file: "capture.bin".into(),
            protocol_version: 14,
            transport: TransportArg::Ripc,
            role: RoleArg::Server,
            compression: CompressionArg::None,
            max_msg_size: None,
            count: None,
        }
    }

    fn collect(bytes: Vec<u8>, args: &DecodeArgs) -> (Vec<Vec<u8>>, DecodeSummary) {
        let mut messages = Vec::new();
        let summary = decode_stream(Cursor::new(bytes), args, |_, m| messages.push(m.to_vec()))
            .unwrap();
        (messages, summary)
    }

    #[test]
    fn splits_plain_packed_and_ping_records() {
        let mut wire = BytesMut::new();
        encode_plain(b"first", &mut wire).unwrap();
        encode_ping(&mut wire);
        encode_packed(&[b"a", b"bb"], &mut wire).unwrap();
        let total = wire.len();

        let (messages, summary) = collect(wire.to_vec(), &args());
        assert_eq!(messages, vec![b"first".to_vec(), b"a".to_vec(), b"bb".to_vec()]);
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.pings, 1);
        assert_eq!(summary.bytes_read, total);
        assert!(!summary.truncated);
    }

    #[test]
    fn count_stops_early() {
        let mut wire = BytesMut::new();
        for body in [&b"one"[..], b"two", b"three"] {
            encode_plain(body, &mut wire).unwrap();
        }
        let mut limited = args();
        limited.count = Some(2);

        let (messages, summary) = collect(wire.to_vec(), &limited);
        assert_eq!(messages.len(), 2);
        assert_eq!(summary.messages, 2);
    }

    #[test]
    fn trailing_partial_record_is_flagged() {
        let mut wire = BytesMut::new();
        encode_plain(b"whole", &mut wire).unwrap();
        encode_plain(b"cut short", &mut wire).unwrap();
        let cut = wire.len() - 4;

        let (messages, summary) = collect(wire[..cut].to_vec(), &args());
        assert_eq!(messages, vec![b"whole".to_vec()]);
        assert!(summary.truncated);
    }

    #[test]
    fn malformed_capture_is_an_error() {
        // length 2 is shorter than the record header
        let err = decode_stream(Cursor::new(vec![0x00, 0x02, 0x02]), &args(), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bad = args();
        bad.protocol_version = 3;
        let err = decode_stream(Cursor::new(Vec::new()), &bad, |_, _| {}).unwrap_err();
        assert!(matches!(err, FrameError::InvalidArgument(_)));
    }
}
