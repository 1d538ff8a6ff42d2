//! Peer transport
//!
//! A [`PeerConnection`] couples the connection state of one remote peer with
//! a [`ChannelPool`] multiplexing its ordered-reliable sub-channels. Real
//! connections are driven by `str0m` ([`rtc`]); [`loopback`] joins two peers
//! inside one process.

pub mod channel;
pub mod connection;
pub mod loopback;
pub mod pool;
pub mod rtc;

pub use channel::{ChannelState, DataChannel, RELIABLE_LABEL};
pub use connection::{ConnectionState, ConnectionType, PeerConnection};
pub use pool::{ChannelPool, PoolEvent, ReceivedData, TransferProgress};
pub use rtc::RtcConnector;
