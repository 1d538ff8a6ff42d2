//! In-process transport joining two peers directly.
//!
//! Every sub-channel on one side is paired with the sub-channel of the same
//! index on the other side; a write is delivered straight into the other
//! side's pool. Closing either side disconnects the other.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::channel::{ChannelCommand, ChannelState, DataChannel, RELIABLE_LABEL};
use super::connection::{ConnectionState, ConnectionType, DriverCommand, PeerConnection};
use super::pool::ChannelPool;
use crate::config::TransferConfig;
use crate::{Error, Result};

#[derive(Clone)]
struct Side {
    pool: Arc<ChannelPool>,
    channels: Vec<DataChannel>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Side {
    fn settle(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = state;
            true
        });
    }

    fn close_channels(&self) {
        for channel in &self.channels {
            channel.set_state(ChannelState::Closed);
        }
    }
}

/// Two connected endpoints: the first is `local`'s view of `remote`, the second
/// `remote`'s view of `local`.
pub fn pair(local: &str, remote: &str, config: TransferConfig) -> (PeerConnection, PeerConnection) {
    let (a_side, a_conn, a_channels, a_commands) = endpoint(remote, &config);
    let (b_side, b_conn, b_channels, b_commands) = endpoint(local, &config);

    tokio::spawn(drive(a_side.clone(), b_side.clone(), a_channels, a_commands));
    tokio::spawn(drive(b_side, a_side, b_channels, b_commands));

    (a_conn, b_conn)
}

fn endpoint(
    peer_id: &str,
    config: &TransferConfig,
) -> (
    Side,
    PeerConnection,
    mpsc::UnboundedReceiver<ChannelCommand>,
    mpsc::UnboundedReceiver<DriverCommand>,
) {
    let (pool, received) = ChannelPool::new(peer_id, config.clone());
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

    let channels: Vec<DataChannel> = (0..config.channels_per_peer.max(1))
        .map(|_| DataChannel::new(RELIABLE_LABEL, channel_tx.clone()))
        .collect();
    for channel in &channels {
        pool.add_channel(channel.clone());
    }

    let side = Side {
        pool: pool.clone(),
        channels,
        state: Arc::new(state_tx),
    };
    // In-process traffic never leaves the host.
    let conn = PeerConnection::new(peer_id, pool, received, state_rx, command_tx)
        .with_connection_type(watch::channel(ConnectionType::Direct).1);
    (side, conn, channel_rx, command_rx)
}

async fn drive(
    local: Side,
    remote: Side,
    mut channels: mpsc::UnboundedReceiver<ChannelCommand>,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
) {
    for channel in &local.channels {
        channel.set_state(ChannelState::Open);
    }
    local.settle(ConnectionState::Connected);

    loop {
        tokio::select! {
            cmd = channels.recv() => match cmd {
                Some(ChannelCommand::Write { channel, data, done }) => {
                    let _ = done.send(deliver(&local, &remote, channel, data));
                }
                Some(ChannelCommand::Close { channel }) => {
                    if let Some(i) = local.channels.iter().position(|c| c.id() == channel) {
                        local.channels[i].set_state(ChannelState::Closed);
                        if let Some(paired) = remote.channels.get(i) {
                            paired.set_state(ChannelState::Closed);
                        }
                    }
                }
                None => break,
            },
            cmd = commands.recv() => match cmd {
                Some(DriverCommand::Signal(signal)) => {
                    debug!("Loopback ignores signal {:?}", signal);
                }
                Some(DriverCommand::Close) | None => break,
            },
        }
    }

    local.close_channels();
    local.settle(ConnectionState::Closed);
    remote.close_channels();
    remote.settle(ConnectionState::Disconnected);
}

fn deliver(local: &Side, remote: &Side, channel: uuid::Uuid, data: bytes::Bytes) -> Result<()> {
    let index = local
        .channels
        .iter()
        .position(|c| c.id() == channel)
        .ok_or_else(|| Error::network("unknown loopback channel"))?;
    let paired = remote
        .channels
        .get(index)
        .filter(|c| c.is_open())
        .ok_or_else(|| Error::network("remote side of loopback channel is closed"))?;
    debug!("Loopback write of {} bytes on {}", data.len(), paired.id());
    remote.pool.handle_chunk(data);
    Ok(())
}
