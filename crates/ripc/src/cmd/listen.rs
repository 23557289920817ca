use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ripc_channel::{ChannelError, ChannelListener};

use crate::cmd::ListenArgs;
use crate::exit::{channel_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat};

/// How often a blocked read wakes up to check for Ctrl-C.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args
        .session
        .to_config()?
        .with_read_timeout(Some(POLL_INTERVAL));
    let listener = ChannelListener::bind(&args.endpoint, config)
        .map_err(|err| channel_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let source = listener.local_endpoint().to_string();
    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let channel = match listener.accept() {
            Ok(channel) => channel,
            Err(err) if is_handshake_refusal(&err) => {
                tracing::warn!(error = %err, "handshake failed");
                continue;
            }
            Err(err) => return Err(channel_error("accept failed", err)),
        };

        while running.load(Ordering::SeqCst) {
            let index = printed.saturating_add(1);
            let shown = channel.read_message_with(|message| {
                print_message(index, message, &source, format);
            });
            match shown {
                Ok(()) => printed = index,
                Err(ChannelError::Timeout(_)) => continue,
                Err(ChannelError::Closed) => break,
                Err(err) => return Err(channel_error("receive failed", err)),
            }

            if let Some(count) = args.count {
                if printed >= count {
                    let _ = channel.close();
                    return Ok(SUCCESS);
                }
            }
        }
        let _ = channel.close();
    }

    Ok(SUCCESS)
}

/// Errors that end one connection attempt but not the listener.
pub(crate) fn is_handshake_refusal(err: &ChannelError) -> bool {
    matches!(
        err,
        ChannelError::HandshakeFailed(_)
            | ChannelError::VersionUnsupported(_)
            | ChannelError::Timeout(_)
    )
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
