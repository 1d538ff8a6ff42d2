//! Peer connections over `str0m`.
//!
//! Each connection owns one `Rtc` instance and one UDP socket, driven by a
//! single tokio task. The task is the only place that touches the `Rtc`;
//! sub-channel handles and the [`PeerConnection`] talk to it through command
//! queues.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::net::{Protocol, Receive};
use str0m::stats::PeerStats;
use str0m::{Candidate, CandidateKind, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{ChannelCommand, ChannelState, DataChannel, RELIABLE_LABEL};
use super::connection::{ConnectionState, ConnectionType, DriverCommand, PeerConnection};
use super::pool::ChannelPool;
use crate::config::TransferConfig;
use crate::model::message::Signal;
use crate::util::host_address;
use crate::{Error, Result};

/// How often `str0m` reports the selected candidate pair.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Creates `str0m` backed peer connections.
#[derive(Clone, Debug)]
pub struct RtcConnector {
    config: TransferConfig,
    bind_ip: IpAddr,
}

impl RtcConnector {
    pub fn new(config: TransferConfig) -> Self {
        Self::with_bind_ip(config, host_address())
    }

    pub fn with_bind_ip(config: TransferConfig, bind_ip: IpAddr) -> Self {
        Self { config, bind_ip }
    }

    /// Start a connection to `peer_id` as the offering side.
    pub async fn offer(&self, peer_id: &str) -> Result<(PeerConnection, Signal)> {
        let (mut rtc, socket, candidates) = self.prepare().await?;

        let mut change = rtc.sdp_api();
        let offered: Vec<ChannelId> = (0..self.config.channels_per_peer.max(1))
            .map(|_| change.add_channel(RELIABLE_LABEL.to_string()))
            .collect();
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| Error::protocol("no changes to offer"))?;

        info!("Offering {} sub-channel(s) to {}", offered.len(), peer_id);
        let signal = Signal::Offer {
            sdp: offer.to_sdp_string(),
        };
        let conn = Driver::spawn(
            peer_id,
            rtc,
            socket,
            candidates,
            Some(pending),
            offered,
            &self.config,
        )?;
        Ok((conn, signal))
    }

    /// Accept an offer from `peer_id`.
    pub async fn answer(&self, peer_id: &str, offer_sdp: &str) -> Result<(PeerConnection, Signal)> {
        let offer = SdpOffer::from_sdp_string(offer_sdp)
            .map_err(|e| Error::protocol(format!("invalid offer from {}: {:?}", peer_id, e)))?;
        let (mut rtc, socket, candidates) = self.prepare().await?;
        let answer = rtc.sdp_api().accept_offer(offer)?;

        info!("Answering offer from {}", peer_id);
        let signal = Signal::Answer {
            sdp: answer.to_sdp_string(),
        };
        let conn = Driver::spawn(peer_id, rtc, socket, candidates, None, vec![], &self.config)?;
        Ok((conn, signal))
    }

    async fn prepare(&self) -> Result<(Rtc, UdpSocket, Vec<Candidate>)> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        let addr = socket.local_addr()?;
        debug!("Bound UDP port: {}", addr);

        let mut rtc = Rtc::builder()
            .set_stats_interval(Some(STATS_INTERVAL))
            .build();
        let candidate = Candidate::host(addr, "udp")
            .map_err(|e| Error::protocol(format!("host candidate {}: {:?}", addr, e)))?;
        rtc.add_local_candidate(candidate.clone());
        Ok((rtc, socket, vec![candidate]))
    }
}

enum Wake {
    Udp(std::io::Result<(usize, SocketAddr)>),
    Channel(Option<ChannelCommand>),
    Command(Option<DriverCommand>),
    Timeout,
    Deadline,
}

struct Driver {
    peer_id: String,
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    local_candidates: Vec<Candidate>,
    pool: Arc<ChannelPool>,
    config: TransferConfig,
    pending: Option<SdpPendingOffer>,
    channels: HashMap<ChannelId, DataChannel>,
    handles: HashMap<Uuid, ChannelId>,
    channel_tx: mpsc::UnboundedSender<ChannelCommand>,
    state: watch::Sender<ConnectionState>,
    connection_type: watch::Sender<ConnectionType>,
    ice_connected: bool,
}

impl Driver {
    fn spawn(
        peer_id: &str,
        rtc: Rtc,
        socket: UdpSocket,
        local_candidates: Vec<Candidate>,
        pending: Option<SdpPendingOffer>,
        offered: Vec<ChannelId>,
        config: &TransferConfig,
    ) -> Result<PeerConnection> {
        let local_addr = socket.local_addr()?;
        let (pool, received) = ChannelPool::new(peer_id, config.clone());
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Connecting);
        let (connection_type, connection_type_rx) = watch::channel(ConnectionType::Unknown);

        let mut driver = Driver {
            peer_id: peer_id.to_string(),
            rtc,
            socket,
            local_addr,
            local_candidates,
            pool: pool.clone(),
            config: config.clone(),
            pending,
            channels: HashMap::new(),
            handles: HashMap::new(),
            channel_tx,
            state,
            connection_type,
            ice_connected: false,
        };
        // Offered channels join the pool right away so early sends wait for them.
        for id in offered {
            driver.attach(id, RELIABLE_LABEL);
        }

        tokio::spawn(driver.run(channel_rx, command_rx));
        Ok(
            PeerConnection::new(peer_id, pool, received, state_rx, command_tx)
                .with_connection_type(connection_type_rx),
        )
    }

    async fn run(
        mut self,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelCommand>,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    ) {
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        let mut buf = vec![0; 2000];

        let outcome = loop {
            let timeout = match self.poll_until_timeout().await {
                Ok(t) => t,
                Err(e) => {
                    warn!("Connection to {} failed: {}", self.peer_id, e);
                    break ConnectionState::Failed;
                }
            };
            let current = *self.state.borrow();
            if current.is_terminal() {
                break current;
            }
            if !self.rtc.is_alive() {
                break ConnectionState::Disconnected;
            }

            let wait = timeout.saturating_duration_since(Instant::now());
            let establishing = current == ConnectionState::Connecting;
            buf.resize(2000, 0);

            let wake = tokio::select! {
                res = self.socket.recv_from(&mut buf) => Wake::Udp(res),
                cmd = channel_rx.recv() => Wake::Channel(cmd),
                cmd = commands.recv() => Wake::Command(cmd),
                _ = tokio::time::sleep(wait) => Wake::Timeout,
                _ = tokio::time::sleep_until(deadline), if establishing => Wake::Deadline,
            };

            match wake {
                Wake::Udp(Ok((n, source))) => {
                    buf.truncate(n);
                    let Ok(contents) = buf.as_slice().try_into() else {
                        continue;
                    };
                    let input = Input::Receive(
                        Instant::now(),
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination: self.local_addr,
                            contents,
                        },
                    );
                    if let Err(e) = self.rtc.handle_input(input) {
                        warn!("Connection to {} rejected input: {:?}", self.peer_id, e);
                        self.rtc.disconnect();
                    }
                }
                Wake::Udp(Err(e)) => {
                    warn!("UDP receive for {} failed: {}", self.peer_id, e);
                    break ConnectionState::Failed;
                }
                Wake::Channel(Some(cmd)) => self.handle_channel_command(cmd),
                Wake::Channel(None) => {}
                Wake::Command(Some(DriverCommand::Signal(signal))) => {
                    if let Err(e) = self.apply_signal(signal) {
                        warn!("Signal from {} failed: {}", self.peer_id, e);
                        break ConnectionState::Failed;
                    }
                }
                Wake::Command(Some(DriverCommand::Close)) | Wake::Command(None) => {
                    break ConnectionState::Closed;
                }
                Wake::Timeout => {
                    if let Err(e) = self.rtc.handle_input(Input::Timeout(Instant::now())) {
                        warn!("Connection to {} timed out internally: {:?}", self.peer_id, e);
                        self.rtc.disconnect();
                    }
                }
                Wake::Deadline => {
                    warn!(
                        "Connection to {} not established within {:?}",
                        self.peer_id, self.config.connect_timeout
                    );
                    break ConnectionState::Failed;
                }
            }
        };

        for channel in self.channels.values() {
            channel.set_state(ChannelState::Closed);
        }
        self.pool.close();
        self.rtc.disconnect();
        self.settle(outcome);
        info!("Connection to {} ended: {:?}", self.peer_id, outcome);
    }

    /// Drain output until `str0m` asks to be woken at a later instant.
    async fn poll_until_timeout(&mut self) -> Result<Instant> {
        loop {
            if !self.rtc.is_alive() {
                return Ok(Instant::now());
            }
            match self.rtc.poll_output()? {
                Output::Timeout(t) => return Ok(t),
                Output::Transmit(t) => {
                    if let Err(e) = self.socket.send_to(&t.contents, t.destination).await {
                        debug!("UDP send to {} failed: {}", t.destination, e);
                    }
                }
                Output::Event(event) => self.handle_event(event),
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected => {
                self.ice_connected = true;
                self.update_connected();
            }
            Event::IceConnectionStateChange(state) => {
                debug!("ICE state with {}: {:?}", self.peer_id, state);
                if state == IceConnectionState::Disconnected {
                    self.settle(ConnectionState::Disconnected);
                }
            }
            Event::ChannelOpen(id, label) => {
                let handle = match self.channels.get(&id) {
                    Some(handle) => handle.clone(),
                    None => match self.attach(id, &label) {
                        Some(handle) => handle,
                        None => return,
                    },
                };
                if let Some(mut channel) = self.rtc.channel(id) {
                    channel.set_buffered_amount_low_threshold(self.config.low_water_mark);
                }
                info!("Sub-channel '{}' to {} open", label, self.peer_id);
                handle.set_state(ChannelState::Open);
                self.update_connected();
            }
            Event::ChannelData(data) => {
                if self.channels.contains_key(&data.id) {
                    self.pool.handle_chunk(Bytes::from(data.data));
                }
            }
            Event::ChannelBufferedAmountLow(id) => {
                let buffered = self.rtc.channel(id).map(|mut c| c.buffered_amount());
                if let (Some(handle), Some(buffered)) = (self.channels.get(&id), buffered) {
                    handle.set_buffered_amount(buffered);
                }
            }
            Event::PeerStats(stats) => self.update_connection_type(&stats),
            Event::ChannelClose(id) => {
                if let Some(handle) = self.channels.remove(&id) {
                    info!("Sub-channel to {} closed", self.peer_id);
                    self.handles.remove(&handle.id());
                    handle.set_state(ChannelState::Closed);
                }
            }
            _ => {}
        }
    }

    /// Track a `str0m` channel; `None` when the pool refuses it.
    fn attach(&mut self, id: ChannelId, label: &str) -> Option<DataChannel> {
        let handle = DataChannel::new(label, self.channel_tx.clone());
        if !self.pool.add_channel(handle.clone()) {
            return None;
        }
        self.handles.insert(handle.id(), id);
        self.channels.insert(id, handle.clone());
        Some(handle)
    }

    fn handle_channel_command(&mut self, cmd: ChannelCommand) {
        match cmd {
            ChannelCommand::Write {
                channel,
                data,
                done,
            } => {
                let _ = done.send(self.write(channel, &data));
            }
            ChannelCommand::Close { channel } => {
                if let Some(id) = self.handles.remove(&channel) {
                    if let Some(handle) = self.channels.remove(&id) {
                        handle.set_state(ChannelState::Closed);
                    }
                }
            }
        }
    }

    fn write(&mut self, handle: Uuid, data: &[u8]) -> Result<()> {
        let id = *self
            .handles
            .get(&handle)
            .ok_or_else(|| Error::network("sub-channel is detached"))?;
        let mut channel = self
            .rtc
            .channel(id)
            .ok_or_else(|| Error::network("sub-channel is closed"))?;
        let written = channel
            .write(true, data)
            .map_err(|e| Error::network(format!("sub-channel write failed: {:?}", e)))?;
        // Messages are written whole or not at all.
        debug_assert_eq!(written, data.len());
        let buffered = channel.buffered_amount();

        if let Some(handle) = self.channels.get(&id) {
            handle.set_buffered_amount(buffered);
        }
        Ok(())
    }

    fn apply_signal(&mut self, signal: Signal) -> Result<()> {
        match signal {
            Signal::Answer { sdp } => {
                let Some(pending) = self.pending.take() else {
                    return Err(Error::protocol("answer without a pending offer"));
                };
                let answer = SdpAnswer::from_sdp_string(&sdp)
                    .map_err(|e| Error::protocol(format!("invalid answer: {:?}", e)))?;
                self.rtc.sdp_api().accept_answer(pending, answer)?;
                info!("Answer from {} accepted", self.peer_id);
            }
            Signal::IceCandidate { candidate } => {
                let candidate = Candidate::from_sdp_string(&candidate)
                    .map_err(|e| Error::protocol(format!("invalid candidate: {:?}", e)))?;
                self.rtc.add_remote_candidate(candidate);
            }
            Signal::Offer { .. } => {
                debug!("Ignoring renegotiation offer from {}", self.peer_id);
            }
        }
        Ok(())
    }

    fn update_connected(&self) {
        if self.ice_connected && self.pool.is_open() {
            let changed = self.state.send_if_modified(|s| {
                if *s == ConnectionState::Connecting {
                    *s = ConnectionState::Connected;
                    true
                } else {
                    false
                }
            });
            if changed {
                info!("Connected to {}", self.peer_id);
            }
        }
    }

    fn update_connection_type(&self, stats: &PeerStats) {
        let Some(pair) = &stats.selected_candidate_pair else {
            return;
        };
        let kind = self
            .local_candidates
            .iter()
            .find(|c| c.addr() == pair.local.addr)
            .map(|c| c.kind());
        let route = connection_type_of(kind);
        let changed = self.connection_type.send_if_modified(|current| {
            if *current == route {
                return false;
            }
            *current = route;
            true
        });
        if changed {
            info!("Route to {} is now {:?} via {}", self.peer_id, route, pair.local.addr);
        }
    }

    fn settle(&self, state: ConnectionState) {
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                return false;
            }
            *s = state;
            true
        });
    }
}

/// A selected local address we did not add ourselves is peer reflexive.
fn connection_type_of(kind: Option<CandidateKind>) -> ConnectionType {
    match kind {
        Some(CandidateKind::Host) => ConnectionType::Direct,
        _ => ConnectionType::Relay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_offer_and_answer_carry_sdp() {
        let connector =
            RtcConnector::with_bind_ip(TransferConfig::default(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let (offering, offer) = connector.offer("bob").await.unwrap();
        let Signal::Offer { sdp } = offer else {
            panic!("expected an offer");
        };
        assert!(sdp.contains("m=application"));
        assert_eq!(offering.pool().channel_count(), 2);
        assert_eq!(offering.state(), ConnectionState::Connecting);
        assert_eq!(offering.connection_type(), ConnectionType::Unknown);

        let (answering, answer) = connector.answer("alice", &sdp).await.unwrap();
        assert!(matches!(answer, Signal::Answer { .. }));

        offering.close();
        answering.close();
        assert!(offering.wait_established().await.is_terminal());
    }

    #[test]
    fn test_connection_type_from_local_candidate() {
        assert_eq!(connection_type_of(Some(CandidateKind::Host)), ConnectionType::Direct);
        assert_eq!(connection_type_of(Some(CandidateKind::Relayed)), ConnectionType::Relay);
        assert_eq!(
            connection_type_of(Some(CandidateKind::ServerReflexive)),
            ConnectionType::Relay
        );
        assert_eq!(connection_type_of(None), ConnectionType::Relay);
    }
}
