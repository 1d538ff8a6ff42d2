//! Peer node
//!
//! Joins a room through a signaling instance and turns the room directory
//! into direct peer connections. The node offers to every client it does not
//! know yet and answers offers relayed to it; each resulting connection is
//! handed to the [`SessionManager`].

use std::collections::HashSet;
use std::sync::Arc;

use futures::{poll, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{SignalingConfig, TransferConfig};
use crate::model::client::Identity;
use crate::model::message::{ClientEntry, RelayedMessage, Signal};
use crate::session::SessionManager;
use crate::signaling::SignalingClient;
use crate::transport::{PeerConnection, RtcConnector};
use crate::{Error, Result};

/// Offers in flight at once during [`PeerNode::update_peer_connections`].
pub const CONNECT_PARALLELISM: usize = 12;

pub struct PeerNode {
    signaling: SignalingClient,
    session: Arc<SessionManager>,
    connector: RtcConnector,
    relayed: Mutex<Option<mpsc::UnboundedReceiver<RelayedMessage>>>,
    offering: Mutex<HashSet<String>>,
}

impl PeerNode {
    pub async fn join(
        endpoint: &str,
        identity: Identity,
        signaling: SignalingConfig,
        transfer: TransferConfig,
    ) -> Result<Arc<Self>> {
        Self::with_connector(endpoint, identity, signaling, RtcConnector::new(transfer)).await
    }

    pub async fn with_connector(
        endpoint: &str,
        identity: Identity,
        signaling: SignalingConfig,
        connector: RtcConnector,
    ) -> Result<Arc<Self>> {
        let session = SessionManager::new(&identity.client_id);
        let (signaling, relayed) = SignalingClient::connect(endpoint, identity, signaling).await?;
        Ok(Arc::new(Self {
            signaling,
            session,
            connector,
            relayed: Mutex::new(Some(relayed)),
            offering: Mutex::new(HashSet::new()),
        }))
    }

    pub fn client_id(&self) -> &str {
        self.signaling.client_id()
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    /// List the room and offer a connection to every client we have none with.
    pub async fn update_peer_connections(self: &Arc<Self>) -> Result<Vec<ClientEntry>> {
        let clients = self.signaling.list_clients().await?;
        let known = self.session.peers();
        let unknown: Vec<String> = clients
            .iter()
            .map(|c| c.client_id.clone())
            .filter(|id| id != self.client_id() && !known.contains(id))
            .collect();
        debug!("{} of {} client(s) need a connection", unknown.len(), clients.len());

        futures::stream::iter(unknown)
            .for_each_concurrent(CONNECT_PARALLELISM, |peer_id| {
                let node = self.clone();
                async move {
                    if let Err(e) = node.connect_to(&peer_id).await {
                        warn!("Connecting to {} failed: {}", peer_id, e);
                    }
                }
            })
            .await;
        Ok(clients)
    }

    /// Offer a connection to `peer_id` and wait for it to settle.
    pub async fn connect_to(self: &Arc<Self>, peer_id: &str) -> Result<bool> {
        let (conn, offer) = self.connector.offer(peer_id).await?;
        self.offering.lock().insert(peer_id.to_string());
        let result = self.settle(peer_id, conn, offer).await;
        self.offering.lock().remove(peer_id);
        result
    }

    /// Handle relayed handshake payloads until signaling goes away.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let Some(mut relayed) = self.relayed.lock().take() else {
            return Err(Error::protocol("peer node is already running"));
        };
        while let Some(message) = relayed.recv().await {
            let source = message.source_client_id;
            let signal: Signal = match serde_json::from_value(message.payload) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("Ignoring relayed message from {}: {}", source, e);
                    continue;
                }
            };
            match signal {
                Signal::Offer { sdp } => {
                    if self.wins_glare(&source) {
                        debug!("Keeping our own offer to {}", source);
                        continue;
                    }
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.accept_offer(&source, &sdp).await {
                            warn!("Answering {} failed: {}", source, e);
                        }
                    });
                }
                signal => {
                    if let Err(e) = self.session.apply_signal(&source, signal) {
                        debug!("Dropping signal from {}: {}", source, e);
                    }
                }
            }
        }
        info!("Signaling stream ended");
        Ok(())
    }

    pub fn close(&self) {
        self.session.disconnect();
        self.signaling.close();
    }

    async fn accept_offer(self: &Arc<Self>, peer_id: &str, sdp: &str) -> Result<bool> {
        info!("Received offer from {}", peer_id);
        let (conn, answer) = self.connector.answer(peer_id, sdp).await?;
        self.settle(peer_id, conn, answer).await
    }

    /// Register `conn` with the session, then send `signal` to the peer.
    async fn settle(&self, peer_id: &str, conn: PeerConnection, signal: Signal) -> Result<bool> {
        let mut settled = Box::pin(self.session.add_peer_connection(peer_id, conn));
        // The first poll registers the connection so replies can be routed to it.
        if let std::task::Poll::Ready(connected) = poll!(settled.as_mut()) {
            return Ok(connected);
        }
        if let Err(e) = self.signaling.send_signal(peer_id, &signal).await {
            self.session.remove_peer_connection(peer_id);
            return Err(e);
        }
        Ok(settled.await)
    }

    /// Simultaneous offers: the lower client id keeps its own.
    fn wins_glare(&self, peer_id: &str) -> bool {
        self.offering.lock().contains(peer_id) && self.client_id() < peer_id
    }
}
