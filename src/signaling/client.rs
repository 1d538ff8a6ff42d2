use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::model::client::Identity;
use crate::model::message::{
    random_token, ClientEntry, OutgoingMessage, RelayStatus, RelayedMessage, Signal, SocketEvent,
    SocketFrame, Token,
};
use crate::{Error, Result};

type Pending = Arc<Mutex<HashMap<Token, oneshot::Sender<SocketFrame>>>>;

/// Peer-side connection to a signaling instance.
pub struct SignalingClient {
    identity: Identity,
    config: SignalingConfig,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Join the room of `identity` through `endpoint` (`ws://host:port/api/websocket`).
    ///
    /// Returns the client and the stream of messages other clients relay to us.
    pub async fn connect(
        endpoint: &str,
        identity: Identity,
        config: SignalingConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayedMessage>)> {
        let url = format!("{}?{}", endpoint, identity.to_query());
        let (ws, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(res)) if res.status() == StatusCode::BAD_REQUEST => {
                return Err(Error::MissingArgument("roomId, clientId or clientSecret"))
            }
            Err(tungstenite::Error::Http(res)) if res.status() == StatusCode::FORBIDDEN => {
                return Err(Error::AuthenticationMismatch(identity.client_id))
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            "Connected to signaling as {} in room {}",
            identity.client_id, identity.room_id
        );

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (relayed_tx, relayed_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(drive(ws, outgoing_rx, outgoing.clone(), relayed_tx, pending.clone()));

        Ok((
            Self {
                identity,
                config,
                outgoing,
                pending,
                task,
            },
            relayed_rx,
        ))
    }

    pub fn client_id(&self) -> &str {
        &self.identity.client_id
    }

    pub fn room_id(&self) -> &str {
        &self.identity.room_id
    }

    pub fn is_connected(&self) -> bool {
        !self.task.is_finished()
    }

    /// Every client in the room, this one included.
    pub async fn list_clients(&self) -> Result<Vec<ClientEntry>> {
        let reply = self.request(SocketEvent::ListClients, Vec::new()).await?;
        reply.parse_body()
    }

    pub async fn send_message(&self, target: &str, payload: serde_json::Value) -> Result<RelayStatus> {
        let body = serde_json::to_vec(&OutgoingMessage {
            target_client_id: target.to_string(),
            payload,
        })?;
        let reply = self.request(SocketEvent::ClientMessage, body).await?;
        reply.parse_body()
    }

    /// Relay a handshake payload; an unacknowledged relay means the target is gone.
    pub async fn send_signal(&self, target: &str, signal: &Signal) -> Result<()> {
        let status = self.send_message(target, to_payload(signal)?).await?;
        if status.is_delivered() {
            Ok(())
        } else {
            Err(Error::TargetOffline(target.to_string()))
        }
    }

    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    async fn request(&self, event: SocketEvent, body: Vec<u8>) -> Result<SocketFrame> {
        let token = random_token();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token, tx);

        let frame = SocketFrame::new(event, token, body);
        if self
            .outgoing
            .send(Message::Binary(frame.encode().to_vec()))
            .is_err()
        {
            self.pending.lock().remove(&token);
            return Err(Error::network("signaling connection closed"));
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::network("signaling connection closed")),
            Err(_) => {
                self.pending.lock().remove(&token);
                Err(Error::Timeout(self.config.request_timeout.as_millis() as u64))
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

async fn drive<S>(
    ws: S,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Message>,
    relayed: mpsc::UnboundedSender<RelayedMessage>,
    pending: Pending,
) where
    S: futures_util::Stream<Item = tungstenite::Result<Message>>
        + futures_util::Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            out = outgoing_rx.recv() => {
                let Some(message) = out else { break };
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let frame = match SocketFrame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Bad frame from signaling: {}", e);
                            continue;
                        }
                    };
                    match frame.event {
                        SocketEvent::Response => {
                            if let Some(tx) = pending.lock().remove(&frame.token) {
                                let _ = tx.send(frame);
                            }
                        }
                        SocketEvent::Heartbeat => {
                            let ack = SocketFrame::new(SocketEvent::Response, frame.token, Vec::new());
                            let _ = outgoing.send(Message::Binary(ack.encode().to_vec()));
                        }
                        SocketEvent::ServerMessage => match frame.parse_body::<Vec<RelayedMessage>>() {
                            Ok(messages) => {
                                for message in messages {
                                    let _ = relayed.send(message);
                                }
                            }
                            Err(e) => warn!("Bad relayed message: {}", e),
                        },
                        other => debug!("Ignoring {:?} from signaling", other),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Signaling connection failed: {}", e);
                    break;
                }
            }
        }
    }
    pending.lock().clear();
    info!("Signaling connection closed");
}
