//! Signaling wire messages
//!
//! Sockets between a client and its signaling instance carry
//! `u8 event | u8,u8 response token | body`. Instances talk to each other over
//! the cross-instance bus with `bincode` encoded [`BusFrame`]s. Bodies are
//! JSON on both paths.

use bincode::config::{self, Configuration};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const BINCODE_CONFIG: Configuration = config::standard();

/// Response correlation token.
pub type Token = [u8; 2];

/// Token used by unsolicited pushes.
pub const NO_TOKEN: Token = [0, 0];

/// Draw a token for a new request. Collisions are not detected.
pub fn random_token() -> Token {
    rand::random()
}

/// Event codes on the client socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketEvent {
    Response = 0,
    ClientMessage = 1,
    ListClients = 2,
    ServerMessage = 3,
    Heartbeat = 4,
}

impl TryFrom<u8> for SocketEvent {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => SocketEvent::Response,
            1 => SocketEvent::ClientMessage,
            2 => SocketEvent::ListClients,
            3 => SocketEvent::ServerMessage,
            4 => SocketEvent::Heartbeat,
            other => return Err(Error::protocol(format!("unknown socket event {}", other))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketFrame {
    pub event: SocketEvent,
    pub token: Token,
    pub body: Bytes,
}

impl SocketFrame {
    pub fn new(event: SocketEvent, token: Token, body: impl Into<Bytes>) -> Self {
        Self {
            event,
            token,
            body: body.into(),
        }
    }

    /// Frame with a JSON body.
    pub fn json<T: Serialize>(event: SocketEvent, token: Token, body: &T) -> Result<Self> {
        Ok(Self::new(event, token, serde_json::to_vec(body)?))
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(3 + self.body.len());
        out.put_u8(self.event as u8);
        out.put_slice(&self.token);
        out.put_slice(&self.body);
        out.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(Error::malformed(format!(
                "socket frame of {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            event: SocketEvent::try_from(data[0])?,
            token: [data[1], data[2]],
            body: Bytes::copy_from_slice(&data[3..]),
        })
    }

    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Event codes on the cross-instance bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum BusEvent {
    Response = 0,
    ListClients = 1,
    ClientMessage = 2,
}

/// One frame on the cross-instance bus.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct BusFrame {
    /// Instance that published the frame
    pub origin: String,
    pub event: BusEvent,
    pub token: Token,
    pub body: Vec<u8>,
}

impl BusFrame {
    pub fn new(origin: &str, event: BusEvent, token: Token, body: Vec<u8>) -> Self {
        Self {
            origin: origin.to_string(),
            event,
            token,
            body,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, BINCODE_CONFIG)
            .map_err(|e| Error::protocol(format!("bus frame encoding failed: {}", e)))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (frame, _): (BusFrame, usize) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)
            .map_err(|e| Error::malformed(format!("bus frame: {}", e)))?;
        Ok(frame)
    }

    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Directory entry returned by `ListClients`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub client_id: String,
}

/// A client asking its instance to relay `payload` to another client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub target_client_id: String,
    pub payload: serde_json::Value,
}

/// A relayed message as delivered to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedMessage {
    pub source_client_id: String,
    pub payload: serde_json::Value,
}

/// Body of a bus `ClientMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusRelay {
    pub target_client_id: String,
    pub messages: Vec<RelayedMessage>,
}

/// Acknowledgement of a `ClientMessage`, HTTP-like status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub status: u16,
}

impl RelayStatus {
    pub const DELIVERED: RelayStatus = RelayStatus { status: 200 };
    pub const TIMED_OUT: RelayStatus = RelayStatus { status: 504 };

    pub fn is_delivered(&self) -> bool {
        self.status == 200
    }
}

/// Peer connection handshake payload relayed through signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_socket_frame_layout() {
        let frame = SocketFrame::new(SocketEvent::ListClients, [7, 9], Bytes::from_static(b"{}"));
        let encoded = frame.encode();
        assert_eq!(encoded[..], [2, 7, 9, b'{', b'}']);
        assert_eq!(SocketFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_socket_frame_rejects_garbage() {
        assert!(matches!(
            SocketFrame::decode(&[1, 0]),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            SocketFrame::decode(&[42, 0, 0]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_bus_frame_roundtrip() {
        let frame = BusFrame::new("instance-a", BusEvent::ClientMessage, [1, 2], b"[]".to_vec());
        let bytes = frame.serialize().unwrap();
        assert_eq!(BusFrame::deserialize(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_json_bodies_use_camel_case() {
        let msg = OutgoingMessage {
            target_client_id: "c2".into(),
            payload: json!("hi"),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"targetClientId": "c2", "payload": "hi"})
        );
        let entries: Vec<ClientEntry> =
            serde_json::from_value(json!([{"clientId": "c1"}])).unwrap();
        assert_eq!(entries[0].client_id, "c1");
    }

    #[test]
    fn test_signal_tagging() {
        let signal = Signal::IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
        };
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        let back: Signal = serde_json::from_value(value).unwrap();
        assert_eq!(back, signal);
    }
}
