use ripc_frame::{ProtocolVersion, Role};
use ripc_transport::{Endpoint, RipcStream};
use tracing::debug;

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::handshake::handshake_client;

/// Connect to `endpoint` and run the client handshake.
///
/// Versions are offered newest first from
/// `config.handshake.protocol_versions`. When the server refuses one, the
/// connection is dropped and a fresh one offers the next older version.
pub fn connect(endpoint: &Endpoint, config: &ChannelConfig) -> Result<Channel> {
    let versions = &config.handshake.protocol_versions;

    for (idx, &version) in versions.iter().enumerate() {
        let stream = ripc_transport::connect(endpoint)?;
        stream.apply_options(&config.socket)?;

        match connect_stream(stream, version, config) {
            Ok(channel) => return Ok(channel),
            Err(ChannelError::Rejected(reason)) if idx + 1 < versions.len() => {
                debug!(%endpoint, %version, %reason, "version refused, falling back");
            }
            Err(err) => return Err(err),
        }
    }

    Err(ChannelError::HandshakeFailed(
        "no protocol versions configured".to_string(),
    ))
}

/// Run the client handshake over an already connected stream.
///
/// No fallback happens here; a refused version surfaces as
/// [`ChannelError::Rejected`].
pub fn connect_stream(
    mut stream: RipcStream,
    version: ProtocolVersion,
    config: &ChannelConfig,
) -> Result<Channel> {
    let timeout = Some(config.handshake.timeout);
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;

    let handshake = handshake_client(&mut stream, version, &config.handshake)?;
    Channel::establish(stream, handshake, Role::Client, config)
}
