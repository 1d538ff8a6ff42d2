//! Runtime configuration for the peer transport and the signaling services.

use std::net::SocketAddr;
use std::time::Duration;

/// Default chunk size, the usual SCTP maximum message size of browsers.
pub const DEFAULT_CHUNK_SIZE: usize = 65535;

/// Buffered byte count above which a sender waits for the channel to drain.
pub const DEFAULT_LOW_WATER_MARK: usize = 65535;

/// Peer transport configuration
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Maximum size of one chunk on the wire, header included
    pub chunk_size: usize,
    /// Buffered amount that suspends the sender until drained
    pub low_water_mark: usize,
    /// Sub-channels opened by the offering side of a connection
    pub channels_per_peer: usize,
    /// Upper bound for a connection to leave the connecting state
    pub connect_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            channels_per_peer: 2,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Signaling instance and client configuration
#[derive(Clone, Debug)]
pub struct SignalingConfig {
    /// Listen address of the WebSocket endpoint
    pub bind_addr: SocketAddr,
    /// Collect window for cross-instance `ListClients` replies
    pub list_clients_timeout: Duration,
    /// Race window for a cross-instance relay acknowledgement
    pub relay_timeout: Duration,
    /// Interval between server pings on an idle socket
    pub ping_interval: Duration,
    /// Silence after which a client is dropped
    pub liveness_timeout: Duration,
    /// Client-side bound on a request/response round trip
    pub request_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8788)),
            list_clients_timeout: Duration::from_millis(1000),
            relay_timeout: Duration::from_millis(3000),
            ping_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP polling fallback configuration
#[derive(Clone, Debug)]
pub struct PollingConfig {
    /// Listen address of the polling endpoint
    pub bind_addr: SocketAddr,
    /// Clients not seen within this window drop out of the directory
    pub client_ttl: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8789)),
            client_ttl: Duration::from_millis(6000),
        }
    }
}
