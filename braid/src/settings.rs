use std::sync::Arc;
use std::time::Duration;

use crate::flow::MAX_WINDOW;

/// Transport tunables, a subset of RFC 9000.
///
/// Flow-control windows are capped at `0x7fffffff` to match the signed
/// window arithmetic used throughout the engine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// How many concurrent bidirectional streams the peer may open.
    pub max_streams_per_connection: u64,

    /// Bytes the peer may have in flight across the whole connection.
    pub connection_flow_control_window: u32,

    /// Bytes the peer may have in flight on a single stream.
    pub incoming_stream_flow_control_window: u32,

    /// Idle time before the connection is torn down with `timed_out`.
    pub idle_timeout: Duration,

    /// The largest UDP payload we will send.
    pub max_packet_size: u16,

    /// The largest serialized header section we accept (HTTP/3 mode);
    /// advertised to the peer in SETTINGS.
    pub max_field_section_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self::server()
    }
}

impl Settings {
    /// Defaults for servers: generous stream count, bounded windows.
    pub fn server() -> Self {
        Self {
            max_streams_per_connection: 100,
            connection_flow_control_window: 1024 * 1024,
            incoming_stream_flow_control_window: 256 * 1024,
            idle_timeout: Duration::from_secs(30),
            max_packet_size: 1452,
            max_field_section_size: 16384,
        }
    }

    /// Defaults for clients.
    pub fn client() -> Self {
        Self {
            max_streams_per_connection: 100,
            connection_flow_control_window: 1024 * 1024,
            incoming_stream_flow_control_window: 256 * 1024,
            idle_timeout: Duration::from_secs(30),
            max_packet_size: 1452,
            max_field_section_size: 16384,
        }
    }

    pub(crate) fn transport_config(&self) -> Arc<quinn_proto::TransportConfig> {
        let mut config = quinn_proto::TransportConfig::default();

        let streams = quinn_proto::VarInt::from_u64(self.max_streams_per_connection)
            .unwrap_or(quinn_proto::VarInt::MAX);
        config.max_concurrent_bidi_streams(streams);

        let conn_window = self.connection_flow_control_window.min(MAX_WINDOW as u32);
        config.receive_window(quinn_proto::VarInt::from_u32(conn_window));

        let stream_window = self
            .incoming_stream_flow_control_window
            .min(MAX_WINDOW as u32);
        config.stream_receive_window(quinn_proto::VarInt::from_u32(stream_window));

        config.max_idle_timeout(self.idle_timeout.try_into().ok());

        config.initial_mtu(self.max_packet_size.max(1200));
        config.min_mtu(1200);

        Arc::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert!(s.max_streams_per_connection > 0);
        assert!(s.incoming_stream_flow_control_window <= MAX_WINDOW as u32);
        assert!(s.max_packet_size >= 1200);

        // Conversion must not panic for any default.
        let _ = Settings::server().transport_config();
        let _ = Settings::client().transport_config();
    }
}
