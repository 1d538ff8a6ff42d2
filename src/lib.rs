//! peer-pilot: rooms of peers exchanging binary payloads over direct
//! connections.
//!
//! The signaling service ([`signaling`]) lets clients of a room find each
//! other and relay handshakes, across any number of service instances. Once
//! peers are connected, the transport ([`transport`]) spreads chunked
//! transfers over several sub-channels and the session layer ([`session`])
//! adds invoke/broadcast exchanges and namespaced feature modules on top.

pub mod config;
pub mod emitter;
pub mod error;
pub mod model;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod util;

pub use error::{Error, Result};
