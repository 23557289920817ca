use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use ripc_channel::ChannelInfo;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    index: usize,
    size: usize,
    payload: String,
    source: &'a str,
    timestamp: String,
}

/// Print one received message. `source` names the peer or capture file.
pub fn print_message(index: usize, payload: &[u8], source: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                index,
                size: payload.len(),
                payload: payload_preview(payload),
                source,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "SIZE", "SOURCE", "PAYLOAD"])
                .add_row(vec![
                    index.to_string(),
                    payload.len().to_string(),
                    source.to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "#{index} size={} source={source} payload={}",
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => {
            print_raw(payload);
        }
    }
}

#[derive(Serialize)]
struct InfoOutput<'a> {
    endpoint: &'a str,
    role: &'static str,
    stream: &'static str,
    transport: &'static str,
    protocol_version: u32,
    max_user_msg_size: usize,
    max_fragment_size: usize,
    compression: &'static str,
    compression_level: u32,
    ping_timeout_secs: u64,
    client_to_server_pings: bool,
    server_to_client_pings: bool,
    peer_component_info: &'a str,
}

impl<'a> InfoOutput<'a> {
    fn new(endpoint: &'a str, info: &'a ChannelInfo) -> Self {
        Self {
            endpoint,
            role: match info.role {
                ripc_frame::Role::Client => "client",
                ripc_frame::Role::Server => "server",
            },
            stream: info.stream,
            transport: info.transport.name(),
            protocol_version: info.version.ripc(),
            max_user_msg_size: info.max_user_msg_size,
            max_fragment_size: info.max_fragment_size,
            compression: info.compression.name(),
            compression_level: info.compression_level,
            ping_timeout_secs: info.ping_timeout.as_secs(),
            client_to_server_pings: info.client_to_server_pings,
            server_to_client_pings: info.server_to_client_pings,
            peer_component_info: &info.peer_component_info,
        }
    }
}

/// Print the negotiated parameters of a channel.
pub fn print_info(endpoint: &str, info: &ChannelInfo, format: OutputFormat) {
    let out = InfoOutput::new(endpoint, info);
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PARAMETER", "VALUE"]);
            for (name, value) in info_rows(&out) {
                table.add_row(vec![name.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("Channel Info:");
            for (name, value) in info_rows(&out) {
                println!("  {:<24}{value}", format!("{name}:"));
            }
        }
        OutputFormat::Raw => {
            println!("{}", out.protocol_version);
        }
    }
}

fn info_rows(out: &InfoOutput<'_>) -> Vec<(&'static str, String)> {
    vec![
        ("Endpoint", out.endpoint.to_string()),
        ("Stream", out.stream.to_string()),
        ("Transport", out.transport.to_string()),
        ("Protocol version", out.protocol_version.to_string()),
        ("Max message size", out.max_user_msg_size.to_string()),
        ("Max fragment size", out.max_fragment_size.to_string()),
        (
            "Compression",
            format!("{} (level {})", out.compression, out.compression_level),
        ),
        ("Ping timeout", format!("{}s", out.ping_timeout_secs)),
        (
            "Pings",
            format!(
                "client->server={} server->client={}",
                out.client_to_server_pings, out.server_to_client_pings
            ),
        ),
        ("Peer", out.peer_component_info.to_string()),
    ]
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payloads_are_summarized() {
        assert_eq!(payload_preview(b"quote"), "quote");
        assert_eq!(payload_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }
}
