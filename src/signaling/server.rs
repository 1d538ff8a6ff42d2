//! WebSocket signaling instance
//!
//! One task per socket. The task owns the sink, so everything that wants to
//! write to the client goes through its [`Outbox`]. Requests that wait on the
//! bus run in their own task and answer through the same outbox.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::bus::Bus;
use super::room::{Outbound, Outbox, Room, RoomRegistry};
use crate::config::SignalingConfig;
use crate::model::client::Identity;
use crate::model::message::{random_token, OutgoingMessage, SocketEvent, SocketFrame};
use crate::{Error, Result};

pub const WEBSOCKET_PATH: &str = "/api/websocket";

pub struct SignalingServer {
    instance_id: String,
    config: SignalingConfig,
    registry: RoomRegistry,
}

impl SignalingServer {
    pub fn new(config: SignalingConfig, bus: Arc<dyn Bus>) -> Arc<Self> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        Arc::new(Self {
            registry: RoomRegistry::new(&instance_id, bus, config.clone()),
            instance_id,
            config,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Bind `bind_addr` from the configuration and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            "Signaling instance {} listening on ws://{}{}",
            self.instance_id,
            listener.local_addr()?,
            WEBSOCKET_PATH
        );
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!("Connection from {} ended: {}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut identity = None;
        let callback = |req: &Request, res: Response| -> std::result::Result<Response, ErrorResponse> {
            let id = self.check_handshake(req)?;
            identity = Some(id);
            Ok(res)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(identity) = identity else {
            return Err(Error::protocol("handshake finished without identity"));
        };

        let (outbox, mut outbound) = mpsc::unbounded_channel();
        let (room, session) = self.registry.join(&identity, outbox.clone())?;
        info!("Client {} joined room {}", identity.client_id, identity.room_id);

        let (mut sink, mut stream) = ws.split();
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                out = outbound.recv() => match out {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = sink.send(Message::Binary(frame.encode().to_vec())).await {
                            warn!("Write to {} failed: {}", identity.client_id, e);
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        room.touch(&identity.client_id);
                        match SocketFrame::decode(&data) {
                            Ok(frame) => self.handle_frame(&room, &identity.client_id, frame, &outbox),
                            Err(e) => warn!("Bad frame from {}: {}", identity.client_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                        room.touch(&identity.client_id);
                    }
                    Some(Err(e)) => {
                        debug!("Socket of {} failed: {}", identity.client_id, e);
                        break;
                    }
                },
                _ = ping.tick() => {
                    if last_seen.elapsed() > self.config.liveness_timeout {
                        info!("Client {} timed out in room {}", identity.client_id, identity.room_id);
                        break;
                    }
                    let heartbeat = SocketFrame::new(SocketEvent::Heartbeat, random_token(), Vec::new());
                    if let Err(e) = sink.send(Message::Binary(heartbeat.encode().to_vec())).await {
                        warn!("Heartbeat to {} failed: {}", identity.client_id, e);
                        break;
                    }
                }
            }
        }

        self.registry.leave(&room, &identity.client_id, session);
        info!("Client {} left room {}", identity.client_id, identity.room_id);
        Ok(())
    }

    fn check_handshake(&self, req: &Request) -> std::result::Result<Identity, ErrorResponse> {
        if req.uri().path().trim_end_matches('/') != WEBSOCKET_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "not_found"));
        }
        let identity = match Identity::from_query(req.uri().query().unwrap_or("")) {
            Ok(identity) => identity,
            Err(e) => {
                info!("Rejected join: {}", e);
                return Err(reject(StatusCode::BAD_REQUEST, "missing_arguments"));
            }
        };
        if let Err(e) = self.registry.authorize(&identity) {
            info!("Rejected join to room {}: {}", identity.room_id, e);
            return Err(reject(StatusCode::FORBIDDEN, "authentication_mismatched"));
        }
        Ok(identity)
    }

    fn handle_frame(&self, room: &Arc<Room>, client_id: &str, frame: SocketFrame, outbox: &Outbox) {
        match frame.event {
            SocketEvent::ListClients | SocketEvent::ClientMessage => {
                let room = room.clone();
                let client_id = client_id.to_string();
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    let token = frame.token;
                    match answer(&room, &client_id, frame).await {
                        Ok(reply) => {
                            let _ = outbox.send(Outbound::Frame(reply));
                        }
                        Err(e) => error!("Request {:?} from {} failed: {}", token, client_id, e),
                    }
                });
            }
            SocketEvent::Heartbeat => {
                let ack = SocketFrame::new(SocketEvent::Response, frame.token, Vec::new());
                let _ = outbox.send(Outbound::Frame(ack));
            }
            // heartbeat acknowledgement, liveness already refreshed
            SocketEvent::Response => {}
            SocketEvent::ServerMessage => {
                warn!("Client {} sent a server-only event", client_id);
            }
        }
    }
}

async fn answer(room: &Room, client_id: &str, frame: SocketFrame) -> Result<SocketFrame> {
    match frame.event {
        SocketEvent::ListClients => {
            let clients = room.list_clients().await?;
            SocketFrame::json(SocketEvent::Response, frame.token, &clients)
        }
        SocketEvent::ClientMessage => {
            let message: OutgoingMessage = frame.parse_body()?;
            let status = room.relay(client_id, message).await?;
            SocketFrame::json(SocketEvent::Response, frame.token, &status)
        }
        other => Err(Error::protocol(format!("{:?} is not a request", other))),
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = status;
    res
}
