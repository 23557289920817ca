use std::sync::Arc;
use std::time::Duration;

use ripc_frame::{
    BufferPool, CompressionType, FrameConfig, ProtocolVersion, TransportProtocol, WriterConfig,
};
use ripc_transport::SocketOptions;

use crate::handshake::HandshakeConfig;

/// Everything needed to open or accept a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub handshake: HandshakeConfig,
    pub socket: SocketOptions,
    /// Framing for records after the handshake. Both ends must agree.
    pub transport: TransportProtocol,
    /// Read buffer sizing, reassembly limit and socket timeouts. The
    /// negotiated max user message size overrides `max_user_msg_size`.
    pub frame: FrameConfig,
    pub writer: WriterConfig,
    /// Shared pool; each channel gets its own when unset.
    pub pool: Option<Arc<BufferPool>>,
}

impl ChannelConfig {
    /// Versions to offer (client) or accept (server), newest first.
    pub fn with_protocol_versions(mut self, versions: &[ProtocolVersion]) -> Self {
        self.handshake = self.handshake.with_protocol_versions(versions);
        self
    }

    pub fn with_compression(mut self, types: &[CompressionType]) -> Self {
        self.handshake = self.handshake.with_compression(types);
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.handshake = self.handshake.with_compression_level(level);
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.handshake = self.handshake.with_ping_timeout(timeout);
        self
    }

    pub fn with_max_user_msg_size(mut self, size: usize) -> Self {
        self.handshake = self.handshake.with_max_user_msg_size(size);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake = self.handshake.with_timeout(timeout);
        self
    }

    pub fn with_socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    pub fn with_transport(mut self, transport: TransportProtocol) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.frame = self.frame.with_read_timeout(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.frame = self.frame.with_write_timeout(timeout);
        self
    }

    pub fn with_writer_config(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub(crate) fn pool(&self) -> Arc<BufferPool> {
        self.pool
            .clone()
            .unwrap_or_else(|| Arc::new(BufferPool::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_reach_nested_configs() {
        let pool = Arc::new(BufferPool::default());
        let cfg = ChannelConfig::default()
            .with_protocol_versions(&[ProtocolVersion::V13])
            .with_compression(&[CompressionType::Zlib])
            .with_compression_level(12)
            .with_read_timeout(Some(Duration::from_millis(50)))
            .with_pool(Arc::clone(&pool));

        assert_eq!(cfg.handshake.protocol_versions, vec![ProtocolVersion::V13]);
        assert_eq!(cfg.handshake.compression_level, 9);
        assert_eq!(cfg.frame.read_timeout, Some(Duration::from_millis(50)));
        assert!(Arc::ptr_eq(&cfg.pool(), &pool));
        assert_eq!(cfg.transport, TransportProtocol::Ripc);
    }

    #[test]
    fn each_channel_gets_a_fresh_pool_by_default() {
        let cfg = ChannelConfig::default();
        assert!(!Arc::ptr_eq(&cfg.pool(), &cfg.pool()));
    }
}
