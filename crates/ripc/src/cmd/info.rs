use crate::cmd::{connect_with_retry, parse_duration, InfoArgs};
use crate::exit::{channel_error, CliResult, SUCCESS};
use crate::output::{print_info, OutputFormat};

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = args.session.to_config()?;
    let channel = connect_with_retry(&args.endpoint, &config, timeout)?;

    channel
        .ping()
        .map_err(|err| channel_error("ping failed", err))?;

    print_info(&args.endpoint.to_string(), channel.info(), format);
    let _ = channel.close();
    Ok(SUCCESS)
}
