#![cfg(all(unix, feature = "cli"))]

use std::path::PathBuf;
use std::process::Command;

use bytes::BytesMut;
use ripc_frame::{
    compressor_for, encode_packed, encode_ping, encode_plain, protocol_for, CompressionType,
    Priority, ProtocolVersion, RecordWriter, Role, TransportProtocol, WriterConfig,
};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/ripc-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn ripc(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_ripc"))
        .args(["--log-level", "error"])
        .args(args)
        .output()
        .expect("ripc should run")
}

#[test]
fn decode_splits_a_captured_stream() {
    let dir = unique_temp_dir("decode");
    let capture = dir.join("capture.bin");
    let mut wire = BytesMut::new();
    encode_plain(b"first", &mut wire).unwrap();
    encode_ping(&mut wire);
    encode_packed(&[b"second", b"third"], &mut wire).unwrap();
    std::fs::write(&capture, &wire).unwrap();

    let output = ripc(&["--format", "json", "decode", capture.to_str().unwrap()]);
    assert!(output.status.success());
    let payloads: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["payload"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(payloads, ["first", "second", "third"]);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn decode_reassembles_compressed_fragments() {
    let dir = unique_temp_dir("decode-zlib");
    let capture = dir.join("capture.bin");

    let mut writer = RecordWriter::new(
        Vec::new(),
        protocol_for(TransportProtocol::Ripc, Role::Client),
        ProtocolVersion::V13,
        1024,
        WriterConfig::default(),
    )
    .unwrap();
    writer.set_compressor(compressor_for(CompressionType::Zlib, 6));
    let text: String = (0..4000).map(|i| format!("{i},")).collect();
    writer.send(text.as_bytes(), Priority::High).unwrap();
    writer.send(b"tail", Priority::High).unwrap();
    while writer.flush().unwrap() > 0 {}
    std::fs::write(&capture, writer.get_ref()).unwrap();

    let output = ripc(&[
        "--format",
        "raw",
        "decode",
        capture.to_str().unwrap(),
        "--protocol-version",
        "13",
        "--compression",
        "zlib",
        "--max-msg-size",
        "1024",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let mut expected = text.into_bytes();
    expected.extend_from_slice(b"tail");
    assert_eq!(output.stdout, expected);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn decode_rejects_a_corrupt_capture() {
    let dir = unique_temp_dir("decode-corrupt");
    let capture = dir.join("capture.bin");
    std::fs::write(&capture, [0x00, 0x01, 0x02, 0xff]).unwrap();

    let output = ripc(&["decode", capture.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("decode failed"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn decode_of_missing_file_fails() {
    let output = ripc(&["decode", "/nonexistent/ripc-capture.bin"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn version_prints_package_version() {
    let output = ripc(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("ripc {}", env!("CARGO_PKG_VERSION")));

    let extended = ripc(&["version", "--extended"]);
    let stdout = String::from_utf8_lossy(&extended.stdout);
    assert!(stdout.contains("protocol_versions: 14, 13, 12"));
    assert!(stdout.contains("transports: ripc, ws-rwf, ws-json"));
}

#[test]
fn bad_protocol_version_is_a_usage_error() {
    let output = ripc(&["send", "127.0.0.1:1", "--protocol-version", "9"]);
    assert_eq!(output.status.code(), Some(64));
}
