use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::pool::{ChannelPool, ReceivedData};
use crate::model::message::Signal;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// How traffic to the peer is routed, judged by the selected local candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Unknown,
    /// Local host candidate
    Direct,
    /// Reflexive or relayed candidate
    Relay,
}

/// Request to the task driving a peer connection.
#[derive(Debug)]
pub enum DriverCommand {
    Signal(Signal),
    Close,
}

/// A negotiated transport to one remote peer.
pub struct PeerConnection {
    peer_id: String,
    state: watch::Receiver<ConnectionState>,
    connection_type: watch::Receiver<ConnectionType>,
    pool: Arc<ChannelPool>,
    received: Mutex<Option<mpsc::UnboundedReceiver<ReceivedData>>>,
    commands: mpsc::UnboundedSender<DriverCommand>,
    closed: AtomicBool,
}

impl PeerConnection {
    pub fn new(
        peer_id: &str,
        pool: Arc<ChannelPool>,
        received: mpsc::UnboundedReceiver<ReceivedData>,
        state: watch::Receiver<ConnectionState>,
        commands: mpsc::UnboundedSender<DriverCommand>,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            state,
            connection_type: watch::channel(ConnectionType::Unknown).1,
            pool,
            received: Mutex::new(Some(received)),
            commands,
            closed: AtomicBool::new(false),
        }
    }

    /// Report route changes through `connection_type` instead of `Unknown`.
    pub fn with_connection_type(mut self, connection_type: watch::Receiver<ConnectionType>) -> Self {
        self.connection_type = connection_type;
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn connection_type(&self) -> ConnectionType {
        *self.connection_type.borrow()
    }

    pub fn subscribe_connection_type(&self) -> watch::Receiver<ConnectionType> {
        self.connection_type.clone()
    }

    /// Wait for the connection to leave `Connecting`.
    ///
    /// A driver that went away without reporting counts as failed.
    pub async fn wait_established(&self) -> ConnectionState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|s| *s != ConnectionState::Connecting).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Failed,
        };
        state
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// Stream of reassembled inbound buffers; can be taken once.
    pub fn take_received(&self) -> Option<mpsc::UnboundedReceiver<ReceivedData>> {
        self.received.lock().take()
    }

    /// Forward a handshake payload from the remote peer to the driver.
    pub fn apply_signal(&self, signal: Signal) -> Result<()> {
        self.commands
            .send(DriverCommand::Signal(signal))
            .map_err(|_| Error::network(format!("connection to {} is gone", self.peer_id)))
    }

    /// Close sub-channels and the transport. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing connection to {}", self.peer_id);
        self.pool.close();
        let _ = self.commands.send(DriverCommand::Close);
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .field("connection_type", &self.connection_type())
            .finish()
    }
}
