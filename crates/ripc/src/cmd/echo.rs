use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ripc_channel::{Channel, ChannelError, ChannelListener};
use ripc_frame::Priority;

use crate::cmd::listen::{install_ctrlc_handler, is_handshake_refusal, POLL_INTERVAL};
use crate::cmd::EchoArgs;
use crate::exit::{channel_error, CliError, CliResult, SUCCESS};
use crate::output::OutputFormat;

enum ReadDisposition {
    Idle,
    Disconnected,
    Fatal(CliError),
}

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let config = args
        .session
        .to_config()?
        .with_read_timeout(Some(POLL_INTERVAL));
    let listener = ChannelListener::bind(&args.endpoint, config)
        .map_err(|err| channel_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        let channel = match listener.accept() {
            Ok(channel) => channel,
            Err(err) if is_handshake_refusal(&err) => {
                tracing::warn!(error = %err, "handshake failed");
                continue;
            }
            Err(err) => return Err(channel_error("accept failed", err)),
        };
        tracing::info!(
            version = %channel.info().version,
            compression = channel.info().compression.name(),
            "peer connected"
        );

        while running.load(Ordering::SeqCst) {
            let message = match channel.read_message() {
                Ok(message) => message,
                Err(err) => match classify_read_error(err) {
                    ReadDisposition::Idle => continue,
                    ReadDisposition::Disconnected => break,
                    ReadDisposition::Fatal(err) => return Err(err),
                },
            };

            tracing::info!(size = message.len(), "echoing message");
            echo(&channel, &message).map_err(|err| channel_error("echo send failed", err))?;
        }
        let _ = channel.close();
    }

    Ok(SUCCESS)
}

fn echo(channel: &Channel, message: &[u8]) -> Result<(), ChannelError> {
    channel.write(message, Priority::High)?;
    while channel.flush()? > 0 {}
    Ok(())
}

fn classify_read_error(err: ChannelError) -> ReadDisposition {
    match err {
        ChannelError::Timeout(_) => ReadDisposition::Idle,
        ChannelError::Closed => ReadDisposition::Disconnected,
        other => ReadDisposition::Fatal(channel_error("receive failed", other)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ripc_frame::FrameError;

    use super::*;

    #[test]
    fn closed_channel_ends_the_session() {
        let disposition = classify_read_error(ChannelError::Closed);
        assert!(matches!(disposition, ReadDisposition::Disconnected));
    }

    #[test]
    fn read_timeout_keeps_polling() {
        let disposition = classify_read_error(ChannelError::Timeout(Duration::from_millis(200)));
        assert!(matches!(disposition, ReadDisposition::Idle));
    }

    #[test]
    fn protocol_violation_is_fatal() {
        let disposition =
            classify_read_error(ChannelError::Frame(FrameError::MalformedHeader("short")));
        match disposition {
            ReadDisposition::Fatal(err) => assert_eq!(err.code, crate::exit::DATA_INVALID),
            _ => panic!("expected fatal disposition"),
        }
    }
}
