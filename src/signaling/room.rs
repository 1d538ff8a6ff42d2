//! Per-instance room directory
//!
//! A [`Room`] only knows the clients this instance holds a socket for. The
//! rest of the room is reached through the bus: `ListClients` collects every
//! instance's reply until a window closes, `ClientMessage` races for the first
//! instance that acknowledges delivery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bus::Bus;
use crate::config::SignalingConfig;
use crate::model::client::{ClientRecord, Identity};
use crate::model::message::{
    random_token, BusEvent, BusFrame, BusRelay, ClientEntry, OutgoingMessage, RelayStatus,
    RelayedMessage, SocketEvent, SocketFrame, Token, NO_TOKEN,
};
use crate::{Error, Result};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// What the socket task of one client is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(SocketFrame),
    Close,
}

pub type Outbox = mpsc::UnboundedSender<Outbound>;

struct Member {
    record: ClientRecord,
    outbox: Outbox,
    session: u64,
}

enum Waiter {
    Collect(mpsc::UnboundedSender<Vec<u8>>),
    First(oneshot::Sender<Vec<u8>>),
}

pub struct Room {
    id: String,
    instance_id: String,
    config: SignalingConfig,
    bus: Arc<dyn Bus>,
    members: Mutex<HashMap<String, Member>>,
    waiters: Mutex<HashMap<Token, Waiter>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    /// Create the room and start following its bus topic.
    pub fn open(id: &str, instance_id: &str, bus: Arc<dyn Bus>, config: SignalingConfig) -> Arc<Self> {
        let frames = bus.subscribe(id);
        let room = Arc::new(Self {
            id: id.to_string(),
            instance_id: instance_id.to_string(),
            config,
            bus,
            members: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        });
        let task = tokio::spawn(follow_bus(Arc::downgrade(&room), frames));
        *room.listener.lock() = Some(task);
        debug!("Room {} opened on {}", id, instance_id);
        room
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check `secret` against a client already registered here.
    pub fn authorize(&self, client_id: &str, secret: &str) -> Result<()> {
        match self.members.lock().get(client_id) {
            Some(member) if !member.record.authenticates(secret) => {
                Err(Error::AuthenticationMismatch(client_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Register a socket for `client_id`, replacing any previous one.
    ///
    /// Returns the session number the socket must present to [`Room::leave`].
    pub fn join(&self, client_id: &str, secret: &str, outbox: Outbox) -> Result<u64> {
        let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let mut members = self.members.lock();
        if let Some(previous) = members.get(client_id) {
            if !previous.record.authenticates(secret) {
                return Err(Error::AuthenticationMismatch(client_id.to_string()));
            }
            info!("Client {} reconnected to room {}, closing old socket", client_id, self.id);
            let _ = previous.outbox.send(Outbound::Close);
        }
        members.insert(
            client_id.to_string(),
            Member {
                record: ClientRecord::new(client_id, secret),
                outbox,
                session,
            },
        );
        Ok(session)
    }

    /// Drop `client_id` unless its socket was already replaced.
    pub fn leave(&self, client_id: &str, session: u64) -> bool {
        let mut members = self.members.lock();
        match members.get(client_id) {
            Some(member) if member.session == session => {
                members.remove(client_id);
                true
            }
            _ => false,
        }
    }

    pub fn touch(&self, client_id: &str) {
        if let Some(member) = self.members.lock().get_mut(client_id) {
            member.record.touch();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub fn local_clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Directory of the whole room: every instance that answers within the
    /// collect window, plus this one. A silent instance only makes the list
    /// partial.
    pub async fn list_clients(&self) -> Result<Vec<ClientEntry>> {
        let replies = self
            .collect(BusEvent::ListClients, Vec::new(), self.config.list_clients_timeout)
            .await?;

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let remote = replies
            .iter()
            .filter_map(|body| match serde_json::from_slice::<Vec<String>>(body) {
                Ok(ids) => Some(ids),
                Err(e) => {
                    warn!("Ignoring malformed ListClients reply: {}", e);
                    None
                }
            })
            .flatten();
        for client_id in remote.chain(self.local_clients()) {
            if seen.insert(client_id.clone()) {
                entries.push(ClientEntry { client_id });
            }
        }
        Ok(entries)
    }

    /// Deliver `message` from `source` to its target, wherever it is connected.
    pub async fn relay(&self, source: &str, message: OutgoingMessage) -> Result<RelayStatus> {
        let relayed = vec![RelayedMessage {
            source_client_id: source.to_string(),
            payload: message.payload,
        }];
        if self.deliver(&message.target_client_id, &relayed)? {
            return Ok(RelayStatus::DELIVERED);
        }

        let body = serde_json::to_vec(&BusRelay {
            target_client_id: message.target_client_id.clone(),
            messages: relayed,
        })?;
        match self
            .first(BusEvent::ClientMessage, body, self.config.relay_timeout)
            .await
        {
            Ok(_) => Ok(RelayStatus::DELIVERED),
            Err(Error::Timeout(ms)) => {
                info!(
                    "No instance acknowledged message for {} in room {} within {}ms",
                    message.target_client_id, self.id, ms
                );
                Ok(RelayStatus::TIMED_OUT)
            }
            Err(e) => Err(e),
        }
    }

    /// Push `messages` to a local client. Returns whether it is connected here.
    pub fn deliver(&self, target: &str, messages: &[RelayedMessage]) -> Result<bool> {
        let members = self.members.lock();
        let Some(member) = members.get(target) else {
            return Ok(false);
        };
        let frame = SocketFrame::json(SocketEvent::ServerMessage, NO_TOKEN, &messages)?;
        Ok(member.outbox.send(Outbound::Frame(frame)).is_ok())
    }

    /// Stop following the bus and close every local socket.
    pub fn close(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
        for (_, member) in self.members.lock().drain() {
            let _ = member.outbox.send(Outbound::Close);
        }
        self.waiters.lock().clear();
        debug!("Room {} closed on {}", self.id, self.instance_id);
    }

    fn publish(&self, event: BusEvent, token: Token, body: Vec<u8>) -> Result<()> {
        let frame = BusFrame::new(&self.instance_id, event, token, body);
        self.bus.publish(&self.id, Bytes::from(frame.serialize()?))
    }

    fn register(&self, waiter: Waiter) -> Token {
        let mut waiters = self.waiters.lock();
        let mut token = random_token();
        while waiters.contains_key(&token) {
            token = random_token();
        }
        waiters.insert(token, waiter);
        token
    }

    /// Publish a request and gather every reply until `window` closes.
    async fn collect(&self, event: BusEvent, body: Vec<u8>, window: Duration) -> Result<Vec<Vec<u8>>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = self.register(Waiter::Collect(tx));
        if let Err(e) = self.publish(event, token, body) {
            self.waiters.lock().remove(&token);
            return Err(e);
        }

        let mut replies = Vec::new();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                reply = rx.recv() => match reply {
                    Some(body) => replies.push(body),
                    None => break,
                },
            }
        }
        self.waiters.lock().remove(&token);
        Ok(replies)
    }

    /// Publish a request and wait for the first reply.
    async fn first(&self, event: BusEvent, body: Vec<u8>, window: Duration) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let token = self.register(Waiter::First(tx));
        if let Err(e) = self.publish(event, token, body) {
            self.waiters.lock().remove(&token);
            return Err(e);
        }

        let result = tokio::time::timeout(window, rx).await;
        self.waiters.lock().remove(&token);
        match result {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(Error::network(format!("room {} closed", self.id))),
            Err(_) => Err(Error::Timeout(window.as_millis() as u64)),
        }
    }

    fn handle_bus_frame(&self, frame: BusFrame) -> Result<()> {
        match frame.event {
            BusEvent::ListClients => {
                let ids = self.local_clients();
                self.publish(BusEvent::Response, frame.token, serde_json::to_vec(&ids)?)
            }
            BusEvent::ClientMessage => {
                let relay: BusRelay = frame.parse_body()?;
                if self.deliver(&relay.target_client_id, &relay.messages)? {
                    debug!(
                        "Delivered {} relayed message(s) to {}",
                        relay.messages.len(),
                        relay.target_client_id
                    );
                    self.publish(BusEvent::Response, frame.token, Vec::new())?;
                }
                Ok(())
            }
            BusEvent::Response => {
                let mut waiters = self.waiters.lock();
                match waiters.get(&frame.token) {
                    Some(Waiter::Collect(tx)) => {
                        let _ = tx.send(frame.body);
                    }
                    Some(Waiter::First(_)) => {
                        if let Some(Waiter::First(tx)) = waiters.remove(&frame.token) {
                            let _ = tx.send(frame.body);
                        }
                    }
                    None => {}
                }
                Ok(())
            }
        }
    }
}

async fn follow_bus(room: Weak<Room>, mut frames: broadcast::Receiver<Bytes>) {
    loop {
        let bytes = match frames.recv().await {
            Ok(bytes) => bytes,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Bus listener lagged, {} frame(s) lost", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(room) = room.upgrade() else {
            break;
        };
        let frame = match BusFrame::deserialize(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping bus frame in room {}: {}", room.id, e);
                continue;
            }
        };
        if frame.origin == room.instance_id {
            continue;
        }
        if let Err(e) = room.handle_bus_frame(frame) {
            warn!("Bus frame in room {} failed: {}", room.id, e);
        }
    }
}

/// Rooms this instance currently hosts.
pub struct RoomRegistry {
    instance_id: String,
    config: SignalingConfig,
    bus: Arc<dyn Bus>,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new(instance_id: &str, bus: Arc<dyn Bus>, config: SignalingConfig) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            config,
            bus,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().get(room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn authorize(&self, identity: &Identity) -> Result<()> {
        match self.get(&identity.room_id) {
            Some(room) => room.authorize(&identity.client_id, &identity.secret),
            None => Ok(()),
        }
    }

    /// Join `identity` to its room, opening the room on first contact.
    pub fn join(&self, identity: &Identity, outbox: Outbox) -> Result<(Arc<Room>, u64)> {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(identity.room_id.clone())
            .or_insert_with(|| {
                Room::open(
                    &identity.room_id,
                    &self.instance_id,
                    self.bus.clone(),
                    self.config.clone(),
                )
            })
            .clone();
        let session = room.join(&identity.client_id, &identity.secret, outbox)?;
        Ok((room, session))
    }

    /// Remove a client's socket; the last one out closes the room.
    pub fn leave(&self, room: &Arc<Room>, client_id: &str, session: u64) {
        let mut rooms = self.rooms.lock();
        if !room.leave(client_id, session) || !room.is_empty() {
            return;
        }
        if rooms.get(room.id()).is_some_and(|r| Arc::ptr_eq(r, room)) {
            rooms.remove(room.id());
        }
        drop(rooms);
        room.close();
        info!("Room {} has no local clients left", room.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::bus::LocalBus;
    use serde_json::json;

    fn fast_config() -> SignalingConfig {
        SignalingConfig {
            list_clients_timeout: Duration::from_millis(100),
            relay_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn registry(instance: &str, bus: &Arc<LocalBus>) -> RoomRegistry {
        RoomRegistry::new(instance, bus.clone(), fast_config())
    }

    #[tokio::test]
    async fn test_join_rejects_mismatched_secret() {
        let bus = Arc::new(LocalBus::new());
        let registry = registry("a", &bus);
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.join(&Identity::new("r1", "c1", "s1"), tx.clone()).unwrap();

        assert!(registry.authorize(&Identity::new("r1", "c1", "s1")).is_ok());
        assert!(matches!(
            registry.authorize(&Identity::new("r1", "c1", "other")),
            Err(Error::AuthenticationMismatch(_))
        ));
        assert!(registry.join(&Identity::new("r1", "c1", "other"), tx).is_err());
        assert!(registry.authorize(&Identity::new("r2", "c1", "other")).is_ok());
    }

    #[tokio::test]
    async fn test_rejoin_replaces_old_socket() {
        let bus = Arc::new(LocalBus::new());
        let registry = registry("a", &bus);
        let id = Identity::new("r1", "c1", "s1");
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (room, old_session) = registry.join(&id, old_tx).unwrap();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        let (_, new_session) = registry.join(&id, new_tx).unwrap();

        assert_eq!(old_rx.recv().await, Some(Outbound::Close));
        // the replaced socket leaving must not evict its successor
        registry.leave(&room, "c1", old_session);
        assert_eq!(room.local_clients(), vec!["c1".to_string()]);

        registry.leave(&room, "c1", new_session);
        assert!(room.is_empty());
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_list_clients_merges_instances() {
        let bus = Arc::new(LocalBus::new());
        let a = registry("a", &bus);
        let b = registry("b", &bus);
        let (tx, _rx1) = mpsc::unbounded_channel();
        let (room_a, _) = a.join(&Identity::new("r1", "c1", "s"), tx).unwrap();
        let (tx, _rx2) = mpsc::unbounded_channel();
        b.join(&Identity::new("r1", "c2", "s"), tx).unwrap();
        let (tx, _rx3) = mpsc::unbounded_channel();
        b.join(&Identity::new("r2", "c3", "s"), tx).unwrap();

        let mut ids: Vec<String> = room_a
            .list_clients()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.client_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn test_relay_across_instances() {
        let bus = Arc::new(LocalBus::new());
        let a = registry("a", &bus);
        let b = registry("b", &bus);
        let (tx, _rx1) = mpsc::unbounded_channel();
        let (room_a, _) = a.join(&Identity::new("r1", "c1", "s"), tx).unwrap();
        let (tx, mut rx2) = mpsc::unbounded_channel();
        b.join(&Identity::new("r1", "c2", "s"), tx).unwrap();

        let status = room_a
            .relay(
                "c1",
                OutgoingMessage {
                    target_client_id: "c2".into(),
                    payload: json!("hi"),
                },
            )
            .await
            .unwrap();
        assert!(status.is_delivered());

        let Some(Outbound::Frame(frame)) = rx2.recv().await else {
            panic!("expected a pushed frame");
        };
        assert_eq!(frame.event, SocketEvent::ServerMessage);
        let messages: Vec<RelayedMessage> = frame.parse_body().unwrap();
        assert_eq!(messages[0].source_client_id, "c1");
        assert_eq!(messages[0].payload, json!("hi"));

        let status = room_a
            .relay(
                "c1",
                OutgoingMessage {
                    target_client_id: "ghost".into(),
                    payload: json!("hi"),
                },
            )
            .await
            .unwrap();
        assert_eq!(status, RelayStatus::TIMED_OUT);
    }
}
