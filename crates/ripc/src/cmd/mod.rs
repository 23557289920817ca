use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Subcommand, ValueEnum};
use ripc_channel::{connect, Channel, ChannelConfig, ChannelError};
use ripc_frame::{CompressionType, Priority, ProtocolVersion, Role, TransportProtocol};
use ripc_transport::{Endpoint, SocketOptions, TransportError};

use crate::exit::{channel_error, CliError, CliResult, TIMEOUT, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod echo;
pub mod info;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an echo server.
    Echo(EchoArgs),
    /// Send messages to a listening peer.
    Send(SendArgs),
    /// Listen and print received messages.
    Listen(ListenArgs),
    /// Connect and print the negotiated session parameters.
    Info(InfoArgs),
    /// Split a captured byte stream into messages.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum CompressionArg {
    None,
    Zlib,
    Lz4,
}

impl From<CompressionArg> for CompressionType {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => CompressionType::None,
            CompressionArg::Zlib => CompressionType::Zlib,
            CompressionArg::Lz4 => CompressionType::Lz4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Ripc,
    WsRwf,
    WsJson,
}

impl From<TransportArg> for TransportProtocol {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Ripc => TransportProtocol::Ripc,
            TransportArg::WsRwf => TransportProtocol::WebSocketRwf,
            TransportArg::WsJson => TransportProtocol::WebSocketJson,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::High => Priority::High,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::Low => Priority::Low,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Client,
    Server,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Client => Role::Client,
            RoleArg::Server => Role::Server,
        }
    }
}

/// Session options shared by every command that opens a channel.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Compression types to offer or accept, most preferred first.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "none",
        env = "RIPC_COMPRESSION"
    )]
    pub compression: Vec<CompressionArg>,
    /// Compression level (0-9).
    #[arg(long, default_value_t = 6, env = "RIPC_COMPRESSION_LEVEL")]
    pub compression_level: u32,
    /// Protocol versions to offer or accept, newest first.
    #[arg(
        long = "protocol-version",
        value_delimiter = ',',
        default_value = "14,13,12",
        env = "RIPC_PROTOCOL_VERSION"
    )]
    pub protocol_versions: Vec<u32>,
    /// Largest message carried in a single record.
    #[arg(long, env = "RIPC_MAX_MSG_SIZE")]
    pub max_msg_size: Option<usize>,
    /// Ping timeout to propose (e.g. 60s).
    #[arg(long, default_value = "60s")]
    pub ping_timeout: String,
    /// Handshake timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub handshake_timeout: String,
    /// Outer framing of records after the handshake.
    #[arg(long, value_enum, default_value = "ripc", env = "RIPC_TRANSPORT")]
    pub transport: TransportArg,
    /// Leave Nagle's algorithm on (clears TCP_NODELAY).
    #[arg(long)]
    pub tcp_delay: bool,
}

impl SessionArgs {
    pub fn to_config(&self) -> CliResult<ChannelConfig> {
        let versions = parse_versions(&self.protocol_versions)?;
        let compression: Vec<CompressionType> = self
            .compression
            .iter()
            .copied()
            .filter(|arg| *arg != CompressionArg::None)
            .map(CompressionType::from)
            .collect();
        let socket = SocketOptions {
            tcp_nodelay: !self.tcp_delay,
            ..SocketOptions::default()
        };

        let mut config = ChannelConfig::default()
            .with_protocol_versions(&versions)
            .with_compression(&compression)
            .with_compression_level(self.compression_level)
            .with_ping_timeout(parse_duration(&self.ping_timeout)?)
            .with_handshake_timeout(parse_duration(&self.handshake_timeout)?)
            .with_socket_options(socket)
            .with_transport(self.transport.into());
        if let Some(size) = self.max_msg_size {
            config = config.with_max_user_msg_size(size);
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Endpoint to bind (host:port or unix:<path>).
    pub endpoint: Endpoint,
    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Endpoint to connect to (host:port or unix:<path>).
    pub endpoint: Endpoint,
    #[command(flatten)]
    pub session: SessionArgs,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Send the payload this many times.
    #[arg(long, default_value_t = 1)]
    pub repeat: usize,
    /// Write queue to use.
    #[arg(long, value_enum, default_value = "high")]
    pub priority: PriorityArg,
    /// Wait for one response message and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the response when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    /// Keep retrying the connection for this long while the peer is not up yet.
    #[arg(long, default_value = "0ms")]
    pub connect_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Endpoint to bind (host:port or unix:<path>).
    pub endpoint: Endpoint,
    #[command(flatten)]
    pub session: SessionArgs,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Endpoint to connect to (host:port or unix:<path>).
    pub endpoint: Endpoint,
    #[command(flatten)]
    pub session: SessionArgs,
    /// Keep retrying the connection for this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Captured byte stream.
    pub file: PathBuf,
    /// Protocol version the stream was negotiated at.
    #[arg(long = "protocol-version", default_value_t = 14)]
    pub protocol_version: u32,
    /// Outer framing of the capture.
    #[arg(long, value_enum, default_value = "ripc")]
    pub transport: TransportArg,
    /// Which end read the capture; WebSocket frames from a client are masked.
    #[arg(long, value_enum, default_value = "server")]
    pub role: RoleArg,
    /// Negotiated compression.
    #[arg(long, value_enum, default_value = "none")]
    pub compression: CompressionArg,
    /// Negotiated max user message size.
    #[arg(long)]
    pub max_msg_size: Option<usize>,
    /// Stop after N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_versions(values: &[u32]) -> CliResult<Vec<ProtocolVersion>> {
    values
        .iter()
        .map(|&value| {
            let version = ProtocolVersion::new(value);
            if version.is_supported() {
                Ok(version)
            } else {
                Err(CliError::new(
                    USAGE,
                    format!("unsupported protocol version: {value}"),
                ))
            }
        })
        .collect()
}

pub fn parse_version(value: u32) -> CliResult<ProtocolVersion> {
    parse_versions(&[value]).map(|mut versions| versions.remove(0))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Connect, retrying while the peer is not listening yet.
pub fn connect_with_retry(
    endpoint: &Endpoint,
    config: &ChannelConfig,
    timeout: Duration,
) -> CliResult<Channel> {
    let start = Instant::now();
    loop {
        match connect(endpoint, config) {
            Ok(channel) => return Ok(channel),
            Err(err) => {
                if !is_retryable_connect_error(&err) {
                    return Err(channel_error("connect failed", err));
                }
                if start.elapsed() >= timeout {
                    if timeout.is_zero() {
                        return Err(channel_error("connect failed", err));
                    }
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("connect timed out after {timeout:?}: {err}"),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn is_retryable_connect_error(err: &ChannelError) -> bool {
    match err {
        ChannelError::Transport(TransportError::Connect { source, .. }) => {
            source.kind() == std::io::ErrorKind::NotFound
                || source.kind() == std::io::ErrorKind::ConnectionRefused
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0ms").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn unknown_protocol_version_is_a_usage_error() {
        let err = parse_versions(&[14, 7]).unwrap_err();
        assert_eq!(err.code, USAGE);
        assert_eq!(parse_version(13).unwrap(), ProtocolVersion::V13);
    }

    #[test]
    fn session_args_build_channel_config() {
        let args = SessionArgs {
            compression: vec![CompressionArg::Lz4, CompressionArg::None],
            compression_level: 3,
            protocol_versions: vec![13, 12],
            max_msg_size: Some(2048),
            ping_timeout: "30s".into(),
            handshake_timeout: "250ms".into(),
            transport: TransportArg::WsRwf,
            tcp_delay: false,
        };
        let config = args.to_config().unwrap();

        assert_eq!(
            config.handshake.protocol_versions,
            vec![ProtocolVersion::V13, ProtocolVersion::V12]
        );
        assert_eq!(config.handshake.compression, vec![CompressionType::Lz4]);
        assert_eq!(config.handshake.compression_level, 3);
        assert_eq!(config.handshake.max_user_msg_size, 2048);
        assert_eq!(config.handshake.ping_timeout, Duration::from_secs(30));
        assert_eq!(config.handshake.timeout, Duration::from_millis(250));
        assert_eq!(config.transport, TransportProtocol::WebSocketRwf);
        assert!(config.socket.tcp_nodelay);
    }
}
