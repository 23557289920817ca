use ripc_frame::Role;
use ripc_transport::{Endpoint, Listener, RipcStream};
use tracing::debug;

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::handshake::handshake_server;

/// Accepts connections and runs the server handshake on each.
pub struct ChannelListener {
    listener: Listener,
    config: ChannelConfig,
}

impl ChannelListener {
    /// Bind and listen on `endpoint`.
    pub fn bind(endpoint: &Endpoint, config: ChannelConfig) -> Result<Self> {
        let listener = Listener::bind(endpoint)?;
        Ok(Self { listener, config })
    }

    /// Accept the next connection and complete its handshake (blocking).
    ///
    /// A failed handshake is returned to the caller; the listener itself
    /// stays usable.
    pub fn accept(&self) -> Result<Channel> {
        let stream = self.listener.accept()?;
        stream.apply_options(&self.config.socket)?;
        accept_stream(stream, &self.config)
    }

    /// The endpoint clients should connect to.
    pub fn local_endpoint(&self) -> Endpoint {
        self.listener.local_endpoint()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

/// Run the server handshake over an accepted stream.
pub fn accept_stream(mut stream: RipcStream, config: &ChannelConfig) -> Result<Channel> {
    let timeout = Some(config.handshake.timeout);
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;

    let handshake = handshake_server(&mut stream, &config.handshake)?;
    debug!(version = %handshake.params.version, "server handshake complete");
    Channel::establish(stream, handshake, Role::Server, config)
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use ripc_frame::{CompressionType, Priority};

    use super::*;
    use crate::connector::connect;
    use crate::error::ChannelError;

    fn temp_socket(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "ripc-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let path = dir.join("channel.sock");
        (dir, path)
    }

    #[test]
    fn accepts_over_unix_socket() {
        let (dir, path) = temp_socket("listen");
        let endpoint = Endpoint::Unix(path);
        let config = ChannelConfig::default().with_compression(&[CompressionType::Lz4]);
        let listener = ChannelListener::bind(&endpoint, config.clone()).unwrap();
        assert_eq!(listener.local_endpoint(), endpoint);

        let server = thread::spawn(move || {
            let channel = listener.accept().expect("listener should accept");
            let msg = channel.read_message().expect("should receive a message");
            channel.write(&msg, Priority::Medium).unwrap();
            channel.flush().unwrap();
            channel
        });

        let client = connect(&endpoint, &config).expect("client should connect");
        assert_eq!(client.info().compression, CompressionType::Lz4);
        assert_eq!(client.info().stream, "unix");

        let payload = vec![0x5A; 20_000];
        client.write(&payload, Priority::Medium).unwrap();
        client.flush().unwrap();
        assert_eq!(&client.read_message().unwrap()[..], payload.as_slice());

        let server = server.join().unwrap();
        assert_eq!(server.info().role, Role::Server);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn listener_survives_a_failed_handshake() {
        let (dir, path) = temp_socket("retry");
        let endpoint = Endpoint::Unix(path);
        let listener = ChannelListener::bind(&endpoint, ChannelConfig::default()).unwrap();

        let server = thread::spawn(move || {
            let first = listener.accept();
            let second = listener.accept();
            (first.map(|_| ()), second.map(|_| ()))
        });

        // a peer that connects and hangs up without a request
        drop(ripc_transport::connect(&endpoint).unwrap());
        let client = connect(&endpoint, &ChannelConfig::default()).unwrap();
        assert!(client.is_open());

        let (first, second) = server.join().unwrap();
        assert!(matches!(first, Err(ChannelError::HandshakeFailed(_))));
        assert!(second.is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
