//! Room signaling: discovery and handshake relay before a direct peer
//! transport exists.

pub mod bus;
pub mod client;
pub mod polling;
pub mod room;
pub mod server;

pub use bus::{Bus, LocalBus};
pub use client::SignalingClient;
pub use polling::{PollingClient, PollingServer, PollingSnapshot};
pub use room::{Room, RoomRegistry};
pub use server::{SignalingServer, WEBSOCKET_PATH};
