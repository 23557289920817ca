use std::fs;

use ripc_channel::{Channel, ChannelError};
use ripc_frame::Priority;

use crate::cmd::{connect_with_retry, parse_duration, SendArgs};
use crate::exit::{channel_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    if args.wait && wait_timeout.is_zero() {
        return Err(CliError::new(USAGE, "--wait-timeout must be greater than zero"));
    }
    let connect_timeout = parse_duration(&args.connect_timeout)?;
    let payload = resolve_payload(&args)?;

    let config = args.session.to_config()?.with_read_timeout(Some(wait_timeout));
    let channel = connect_with_retry(&args.endpoint, &config, connect_timeout)?;
    tracing::debug!(
        version = %channel.info().version,
        compression = channel.info().compression.name(),
        "connected"
    );

    send_all(&channel, &payload, args.repeat, args.priority.into())
        .map_err(|err| channel_error("send failed", err))?;

    if args.wait {
        let response = channel
            .read_message()
            .map_err(|err| channel_error("receive failed", err))?;
        print_message(1, &response, &args.endpoint.to_string(), format);
    }

    if let Err(err) = channel.close() {
        tracing::debug!(error = %err, "close failed");
    }
    Ok(SUCCESS)
}

fn send_all(
    channel: &Channel,
    payload: &[u8],
    repeat: usize,
    priority: Priority,
) -> Result<(), ChannelError> {
    for _ in 0..repeat {
        channel.write(payload, priority)?;
    }
    while channel.flush()? > 0 {}
    Ok(())
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cmd::Command;

    #[derive(Parser)]
    struct Harness {
        #[command(subcommand)]
        command: Command,
    }

    fn send_args(argv: &[&str]) -> SendArgs {
        let mut full = vec!["ripc", "send", "127.0.0.1:9"];
        full.extend_from_slice(argv);
        match Harness::try_parse_from(full).unwrap().command {
            Command::Send(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn payload_comes_from_the_chosen_flag() {
        assert_eq!(resolve_payload(&send_args(&["--data", "hi"])).unwrap(), b"hi");
        assert_eq!(
            resolve_payload(&send_args(&["--json", r#"{"px":1}"#])).unwrap(),
            br#"{"px":1}"#
        );
        assert!(resolve_payload(&send_args(&[])).unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_a_usage_error() {
        let err = resolve_payload(&send_args(&["--json", "{nope"])).unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = resolve_payload(&send_args(&["--file", "/nonexistent/ripc-payload"]))
            .unwrap_err();
        assert!(err.message.starts_with("failed reading /nonexistent/ripc-payload"));
    }
}
