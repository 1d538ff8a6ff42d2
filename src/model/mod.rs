//! Wire formats and data models
//!
//! Codecs shared by the peer transport ([`payload`], [`chunk`]), the
//! signaling messages ([`message`]) and the client identity and directory
//! records ([`client`]).

pub mod chunk;
pub mod client;
pub mod message;
pub mod payload;
