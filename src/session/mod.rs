//! Peer session manager
//!
//! Owns one [`PeerConnection`] per remote client id and layers two exchanges
//! on top of each connection's sub-channel pool:
//!
//! - invoke: correlated request/reply, matched by a per-call reply id
//! - broadcast: fire-and-forget publish to a set of peers
//!
//! Handlers are registered per raw event name. Feature modules ([`Module`])
//! scope their names as `"{namespace}/{event}"`.
//!
//! A single invoke can be followed through [`InvokeProgress`]: the request
//! travels on a stream id picked by the caller and names the stream id its
//! reply should use, so both directions are observable per call.

pub mod file;
pub mod message;
pub mod module;
pub mod profile;
pub mod protocol;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::emitter::{Emitter, Subscription};
use crate::model::message::Signal;
use crate::transport::{
    ChannelPool, ConnectionState, ConnectionType, PeerConnection, PoolEvent, ReceivedData,
    TransferProgress,
};
use crate::{Error, Result};
use protocol::{decode_message, encode_message, reply_id, Header, InvokeArgs};

pub use file::{FileEvent, FileEventKind, FileModule};
pub use message::{ChatMessage, MessageEvent, MessageModule};
pub use module::{Module, ModuleMessage, ModuleRequest};
pub use profile::{ClientProfile, ClientStatus, ProfileEvent, ProfileModule, UserProfile};

/// Lifecycle of a peer; the payload is the peer's client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    PeerConnecting,
    PeerConnected,
    PeerDisconnected,
    /// The selected route to the peer changed; see [`SessionManager::connection_type`]
    PeerConnectionTypeChanged,
}

/// An incoming invoke as seen by its handler.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub event: String,
    pub source_client_id: String,
    pub target_client_id: String,
    pub data: Option<Bytes>,
}

/// An incoming broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub event: String,
    pub source_client_id: String,
    pub data: Option<Bytes>,
}

pub type InvokeHandler =
    Arc<dyn Fn(InvokeRequest) -> BoxFuture<'static, Result<Option<Bytes>>> + Send + Sync>;

/// Called with the progress of one transfer belonging to a single invoke.
pub type ProgressHandler = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Per-call progress callbacks for [`SessionManager::invoke_with_progress`].
#[derive(Clone, Default)]
pub struct InvokeProgress {
    /// Request bytes handed to the transport
    pub on_request: Option<ProgressHandler>,
    /// Reply chunks received so far, out of the reply's chunk count
    pub on_response: Option<ProgressHandler>,
}

#[derive(Clone)]
struct InvokeListener {
    handler: InvokeHandler,
    on_reply_progress: Option<ProgressHandler>,
}

type PendingReply = oneshot::Sender<Result<Option<Bytes>>>;

/// Forwards pool progress of one stream until dropped.
struct Follower(Option<Subscription<PoolEvent, TransferProgress>>);

impl Follower {
    fn new(pool: &ChannelPool, kind: PoolEvent, stream_id: u32, handler: Option<ProgressHandler>) -> Self {
        Self(handler.map(|handler| {
            pool.events().on(kind, move |progress: &TransferProgress| {
                if progress.stream_id == stream_id {
                    handler(progress);
                }
            })
        }))
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            subscription.unsubscribe();
        }
    }
}

struct PeerEntry {
    conn: Arc<PeerConnection>,
    generation: u64,
    pending: HashMap<String, PendingReply>,
    /// Receive loop, state watcher and running invoke handlers
    tasks: Vec<JoinHandle<()>>,
}

pub struct SessionManager {
    client_id: String,
    peers: Mutex<HashMap<String, PeerEntry>>,
    invoke_handlers: Mutex<HashMap<String, InvokeListener>>,
    broadcasts: Emitter<String, BroadcastMessage>,
    events: Emitter<SessionEvent, String>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(client_id: &str) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.to_string(),
            peers: Mutex::new(HashMap::new()),
            invoke_handlers: Mutex::new(HashMap::new()),
            broadcasts: Emitter::new(),
            events: Emitter::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn events(&self) -> &Emitter<SessionEvent, String> {
        &self.events
    }

    /// Take ownership of `conn` and wait for it to settle.
    ///
    /// Returns whether the peer ended up connected. A connection that fails
    /// to connect is torn down before this returns.
    pub async fn add_peer_connection(self: &Arc<Self>, peer_id: &str, conn: PeerConnection) -> bool {
        if self.peers.lock().contains_key(peer_id) {
            self.remove_peer_connection(peer_id);
        }

        let conn = Arc::new(conn);
        let received = conn.take_received();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        self.peers.lock().insert(
            peer_id.to_string(),
            PeerEntry {
                conn: conn.clone(),
                generation,
                pending: HashMap::new(),
                tasks: Vec::new(),
            },
        );
        self.events
            .dispatch(&SessionEvent::PeerConnecting, &peer_id.to_string());

        let state = conn.wait_established().await;
        if !self.is_current(peer_id, generation) {
            debug!("Peer {} was replaced while connecting", peer_id);
            return false;
        }
        if state != ConnectionState::Connected {
            info!("Peer {} did not connect: {:?}", peer_id, state);
            self.remove_entry(peer_id, Some(generation));
            return false;
        }

        let mut tasks = vec![];
        if let Some(received) = received {
            tasks.push(tokio::spawn(receive_loop(
                Arc::downgrade(self),
                peer_id.to_string(),
                received,
            )));
        }
        tasks.push(tokio::spawn(watch_connection(
            Arc::downgrade(self),
            peer_id.to_string(),
            generation,
            conn.clone(),
        )));
        match self.peers.lock().get_mut(peer_id) {
            Some(entry) if entry.generation == generation => entry.tasks.extend(tasks),
            _ => tasks.iter().for_each(JoinHandle::abort),
        }

        info!("Peer {} connected", peer_id);
        self.events
            .dispatch(&SessionEvent::PeerConnected, &peer_id.to_string());
        true
    }

    /// Tear down the connection to `peer_id`. A no-op for unknown peers.
    pub fn remove_peer_connection(&self, peer_id: &str) -> bool {
        self.remove_entry(peer_id, None)
    }

    fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.peers
            .lock()
            .get(peer_id)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
    }

    fn remove_entry(&self, peer_id: &str, generation: Option<u64>) -> bool {
        let entry = {
            let mut peers = self.peers.lock();
            match peers.get(peer_id) {
                Some(e) if generation.map_or(true, |g| g == e.generation) => peers.remove(peer_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        info!("Removing peer {}", peer_id);
        self.events
            .dispatch(&SessionEvent::PeerDisconnected, &peer_id.to_string());
        entry.conn.close();
        for (_, reply) in entry.pending {
            let _ = reply.send(Err(Error::network(format!("peer {} disconnected", peer_id))));
        }
        for task in entry.tasks {
            task.abort();
        }
        true
    }

    /// Tear down every peer.
    pub fn disconnect(&self) {
        let peers: Vec<String> = self.peers.lock().keys().cloned().collect();
        for peer_id in peers {
            self.remove_peer_connection(&peer_id);
        }
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.peers.lock().get(peer_id).map(|e| e.conn.state())
    }

    pub fn connection_type(&self, peer_id: &str) -> Option<ConnectionType> {
        self.peers.lock().get(peer_id).map(|e| e.conn.connection_type())
    }

    /// Hand a relayed handshake payload to the connection of `peer_id`.
    pub fn apply_signal(&self, peer_id: &str, signal: Signal) -> Result<()> {
        let conn = self.peers.lock().get(peer_id).map(|e| e.conn.clone());
        match conn {
            Some(conn) => conn.apply_signal(signal),
            None => Err(Error::TargetOffline(peer_id.to_string())),
        }
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, e)| e.conn.state() == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Call the handler registered for `event` on `target` and wait for its reply.
    ///
    /// There is no deadline here; callers that need one wrap the future.
    pub async fn invoke(&self, event: &str, data: Option<Bytes>, target: &str) -> Result<Option<Bytes>> {
        self.invoke_with_progress(event, data, target, InvokeProgress::default())
            .await
    }

    /// [`invoke`](Self::invoke), reporting the progress of this call's request
    /// and reply. Calls to self report nothing.
    pub async fn invoke_with_progress(
        &self,
        event: &str,
        data: Option<Bytes>,
        target: &str,
        progress: InvokeProgress,
    ) -> Result<Option<Bytes>> {
        if target == self.client_id {
            let handler = self
                .invoke_handlers
                .lock()
                .get(event)
                .map(|l| l.handler.clone());
            let Some(handler) = handler else {
                return Ok(None);
            };
            return handler(InvokeRequest {
                event: event.to_string(),
                source_client_id: self.client_id.clone(),
                target_client_id: self.client_id.clone(),
                data,
            })
            .await;
        }

        let reply_id = reply_id(event);
        let request_stream: u32 = rand::random();
        let reply_stream: u32 = rand::random();
        let message = encode_message(
            &Header::request(event, &reply_id, reply_stream),
            data.as_ref(),
        )?;

        let (tx, rx) = oneshot::channel();
        let conn = {
            let mut peers = self.peers.lock();
            let entry = peers
                .get_mut(target)
                .filter(|e| e.conn.state() == ConnectionState::Connected)
                .ok_or_else(|| Error::TargetOffline(target.to_string()))?;
            entry.pending.insert(reply_id.clone(), tx);
            entry.conn.clone()
        };

        let pool = conn.pool();
        let _response = Follower::new(
            pool,
            PoolEvent::ReceivedChunk,
            reply_stream,
            progress.on_response,
        );
        let sent = {
            let _request =
                Follower::new(pool, PoolEvent::Enqueue, request_stream, progress.on_request);
            pool.send(message, Some(request_stream)).await
        };
        if let Err(e) = sent {
            self.take_pending(target, &reply_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::network(format!("peer {} went away", target))),
        }
    }

    fn take_pending(&self, peer_id: &str, reply_id: &str) -> Option<PendingReply> {
        self.peers
            .lock()
            .get_mut(peer_id)
            .and_then(|e| e.pending.remove(reply_id))
    }

    pub fn set_invoke_listener<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(InvokeRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Bytes>>> + Send + 'static,
    {
        self.insert_listener(event, handler, None);
    }

    /// Like [`set_invoke_listener`](Self::set_invoke_listener); `on_reply_progress`
    /// follows each reply as it is handed to the transport.
    pub fn set_invoke_listener_with_progress<F, Fut>(
        &self,
        event: &str,
        handler: F,
        on_reply_progress: ProgressHandler,
    ) where
        F: Fn(InvokeRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Bytes>>> + Send + 'static,
    {
        self.insert_listener(event, handler, Some(on_reply_progress));
    }

    fn insert_listener<F, Fut>(&self, event: &str, handler: F, on_reply_progress: Option<ProgressHandler>)
    where
        F: Fn(InvokeRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Bytes>>> + Send + 'static,
    {
        let handler: InvokeHandler = Arc::new(move |req| handler(req).boxed());
        self.invoke_handlers.lock().insert(
            event.to_string(),
            InvokeListener {
                handler,
                on_reply_progress,
            },
        );
    }

    pub fn delete_invoke_listener(&self, event: &str) {
        self.invoke_handlers.lock().remove(event);
    }

    pub fn has_invoke_listener(&self, event: &str) -> bool {
        self.invoke_handlers.lock().contains_key(event)
    }

    /// Publish `event` to `peers` (default: every peer) that are connected.
    ///
    /// Best effort: failures are logged per recipient. Returns the number of
    /// peers the message was handed to.
    pub async fn broadcast(&self, event: &str, data: Option<Bytes>, peers: Option<Vec<String>>) -> Result<usize> {
        let message = encode_message(&Header::broadcast(event), data.as_ref())?;
        let targets: Vec<(String, Arc<PeerConnection>)> = {
            let table = self.peers.lock();
            let ids = peers.unwrap_or_else(|| table.keys().cloned().collect());
            ids.into_iter()
                .filter_map(|id| {
                    let conn = table.get(&id)?.conn.clone();
                    (conn.state() == ConnectionState::Connected).then_some((id, conn))
                })
                .collect()
        };

        let sends = targets.iter().map(|(id, conn)| {
            let message = message.clone();
            async move {
                match conn.pool().send(message, None).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Broadcast of {} to {} failed: {}", event, id, e);
                        false
                    }
                }
            }
        });
        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        Ok(delivered)
    }

    pub fn add_broadcast_listener<F>(&self, event: &str, handler: F) -> Subscription<String, BroadcastMessage>
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.broadcasts.on(event.to_string(), handler)
    }

    pub fn remove_broadcast_listeners(&self, event: &str) {
        self.broadcasts.off_all(&event.to_string());
    }

    fn handle_data(self: &Arc<Self>, peer_id: &str, data: ReceivedData) {
        let (header, body) = match decode_message(&data.bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", peer_id, e);
                return;
            }
        };

        match header {
            Header::Invoke(InvokeArgs {
                handler_id,
                reply_id: Some(reply_id),
                reply_stream_id,
            }) => self.handle_request(peer_id, handler_id, reply_id, reply_stream_id, body),
            Header::Invoke(InvokeArgs {
                handler_id,
                reply_id: None,
                ..
            }) => match self.take_pending(peer_id, &handler_id) {
                Some(reply) => {
                    let _ = reply.send(Ok(body));
                }
                None => debug!("Ignoring reply {} from {}", handler_id, peer_id),
            },
            Header::Broadcast(args) => {
                self.broadcasts.dispatch(
                    &args.event,
                    &BroadcastMessage {
                        event: args.event.clone(),
                        source_client_id: peer_id.to_string(),
                        data: body,
                    },
                );
            }
        }
    }

    fn handle_request(
        self: &Arc<Self>,
        peer_id: &str,
        handler_id: String,
        reply_id: String,
        reply_stream_id: Option<u32>,
        body: Option<Bytes>,
    ) {
        let listener = self.invoke_handlers.lock().get(&handler_id).cloned();
        let Some(InvokeListener {
            handler,
            on_reply_progress,
        }) = listener
        else {
            debug!("No invoke handler for {} (from {})", handler_id, peer_id);
            return;
        };
        let (conn, generation) = match self.peers.lock().get(peer_id) {
            Some(entry) => (entry.conn.clone(), entry.generation),
            None => return,
        };

        let request = InvokeRequest {
            event: handler_id.clone(),
            source_client_id: peer_id.to_string(),
            target_client_id: self.client_id.clone(),
            data: body,
        };
        let reply_stream = reply_stream_id.unwrap_or_else(rand::random);
        let source = peer_id.to_string();
        let task = tokio::spawn(async move {
            let peer_id = source;
            let result = match handler(request).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Invoke handler {} for {} failed: {}", handler_id, peer_id, e);
                    return;
                }
            };
            let reply = match encode_message(&Header::reply(&reply_id), result.as_ref()) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Failed to encode reply {}: {}", reply_id, e);
                    return;
                }
            };
            let pool = conn.pool();
            let _progress =
                Follower::new(pool, PoolEvent::Enqueue, reply_stream, on_reply_progress);
            if let Err(e) = pool.send(reply, Some(reply_stream)).await {
                debug!("Reply {} to {} not delivered: {}", reply_id, peer_id, e);
            }
        });

        // Aborted with the peer; finished handlers are pruned here.
        let mut peers = self.peers.lock();
        match peers.get_mut(peer_id) {
            Some(entry) if entry.generation == generation => {
                entry.tasks.retain(|t| !t.is_finished());
                entry.tasks.push(task);
            }
            _ => task.abort(),
        }
    }
}

async fn receive_loop(
    manager: Weak<SessionManager>,
    peer_id: String,
    mut received: mpsc::UnboundedReceiver<ReceivedData>,
) {
    while let Some(data) = received.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.handle_data(&peer_id, data);
    }
}

async fn watch_connection(
    manager: Weak<SessionManager>,
    peer_id: String,
    generation: u64,
    conn: Arc<PeerConnection>,
) {
    let mut state = conn.subscribe_state();
    // Unseen since the connection was created, so early changes still fire.
    let mut route = conn.subscribe_connection_type();
    let mut route_open = true;

    loop {
        tokio::select! {
            _ = state.wait_for(|s| s.is_terminal()) => break,
            changed = route.changed(), if route_open => {
                if changed.is_err() {
                    route_open = false;
                    continue;
                }
                let connection_type = *route.borrow_and_update();
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                debug!("Route to {} is now {:?}", peer_id, connection_type);
                manager
                    .events
                    .dispatch(&SessionEvent::PeerConnectionTypeChanged, &peer_id);
            }
        }
    }
    drop(conn);
    if let Some(manager) = manager.upgrade() {
        debug!("Connection to {} reached a terminal state", peer_id);
        manager.remove_entry(&peer_id, Some(generation));
    }
}
