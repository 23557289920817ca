use ripc_frame::{ProtocolVersion, TransportProtocol};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("ripc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let versions = ProtocolVersion::SUPPORTED
        .iter()
        .map(|v| v.ripc().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let transports = [
        TransportProtocol::Ripc,
        TransportProtocol::WebSocketRwf,
        TransportProtocol::WebSocketJson,
    ]
    .map(TransportProtocol::name)
    .join(", ");

    println!("name: ripc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol_versions: {versions}");
    println!("transports: {transports}");
    println!("compression: none, zlib, lz4");
    println!("target: {}", option_env!("RIPC_BUILD_TARGET").unwrap_or("unknown"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));

    Ok(SUCCESS)
}
