//! `profile` namespace: display names of connected peers and how each one is
//! reached.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::module::{Module, ModuleMessage};
use super::{BroadcastMessage, SessionEvent, SessionManager};
use crate::emitter::{Emitter, Subscription};
use crate::model::payload::Value;
use crate::transport::ConnectionType;
use crate::Result;

const NAMESPACE: &str = "profile";
const GET_PROFILE: &str = "get-profile";
const PROFILE_CHANGED: &str = "profile-changed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientProfile {
    pub client_id: String,
    pub profile: Option<UserProfile>,
    pub status: ClientStatus,
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileEvent {
    PeerConnecting,
    PeerConnected,
    PeerDisconnected,
    PeerChanged,
}

pub struct ProfileModule {
    module: Module,
    profile: Mutex<UserProfile>,
    clients: Mutex<HashMap<String, ClientProfile>>,
    events: Emitter<ProfileEvent, ClientProfile>,
    session_subscriptions: Mutex<Vec<Subscription<SessionEvent, String>>>,
    broadcast_subscription: Mutex<Option<Subscription<String, BroadcastMessage>>>,
}

impl ProfileModule {
    pub fn new(manager: Arc<SessionManager>, profile: UserProfile) -> Result<Arc<Self>> {
        let this = Arc::new(Self {
            module: Module::new(NAMESPACE, manager.clone())?,
            profile: Mutex::new(profile),
            clients: Mutex::new(HashMap::new()),
            events: Emitter::new(),
            session_subscriptions: Mutex::new(Vec::new()),
            broadcast_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&this);
        this.module.set_invoke_listener(GET_PROFILE, move |_| {
            let profile = weak.upgrade().map(|m| m.profile());
            async move {
                match profile {
                    Some(profile) => Ok(Some(Value::object(&profile)?)),
                    None => Ok(None),
                }
            }
        });

        let subscriptions = vec![
            manager.events().on(SessionEvent::PeerConnecting, {
                let weak = Arc::downgrade(&this);
                move |peer_id: &String| {
                    if let Some(module) = weak.upgrade() {
                        module.peer_connecting(peer_id);
                    }
                }
            }),
            manager.events().on(SessionEvent::PeerConnected, {
                let weak = Arc::downgrade(&this);
                move |peer_id: &String| {
                    let weak = weak.clone();
                    let peer_id = peer_id.clone();
                    tokio::spawn(async move { peer_connected(weak, peer_id).await });
                }
            }),
            manager.events().on(SessionEvent::PeerDisconnected, {
                let weak = Arc::downgrade(&this);
                move |peer_id: &String| {
                    if let Some(module) = weak.upgrade() {
                        module.peer_disconnected(peer_id);
                    }
                }
            }),
            manager.events().on(SessionEvent::PeerConnectionTypeChanged, {
                let weak = Arc::downgrade(&this);
                move |peer_id: &String| {
                    if let Some(module) = weak.upgrade() {
                        module.connection_type_changed(peer_id);
                    }
                }
            }),
        ];
        *this.session_subscriptions.lock() = subscriptions;

        let weak = Arc::downgrade(&this);
        let subscription = this
            .module
            .add_broadcast_listener(PROFILE_CHANGED, move |msg: ModuleMessage| {
                if let Some(module) = weak.upgrade() {
                    module.profile_changed(msg);
                }
            });
        *this.broadcast_subscription.lock() = Some(subscription);

        Ok(this)
    }

    pub fn events(&self) -> &Emitter<ProfileEvent, ClientProfile> {
        &self.events
    }

    pub fn profile(&self) -> UserProfile {
        self.profile.lock().clone()
    }

    pub fn client(&self, client_id: &str) -> Option<ClientProfile> {
        self.clients.lock().get(client_id).cloned()
    }

    pub fn clients(&self) -> Vec<ClientProfile> {
        let mut clients: Vec<ClientProfile> = self.clients.lock().values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// Replace the local profile and tell every connected peer.
    pub async fn set_profile(&self, profile: UserProfile) -> Result<usize> {
        *self.profile.lock() = profile.clone();
        self.module
            .broadcast(PROFILE_CHANGED, Some(Value::object(&profile)?), None)
            .await
    }

    /// Ask `peer_id` for its profile.
    pub async fn fetch_profile(&self, peer_id: &str) -> Result<Option<UserProfile>> {
        match self.module.invoke(GET_PROFILE, None, peer_id).await? {
            Some(value) => Ok(Some(value.into_object()?)),
            None => Ok(None),
        }
    }

    fn update<F>(&self, client_id: &str, event: ProfileEvent, apply: F)
    where
        F: FnOnce(&mut ClientProfile),
    {
        let snapshot = {
            let mut clients = self.clients.lock();
            let client = clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientProfile {
                    client_id: client_id.to_string(),
                    profile: None,
                    status: ClientStatus::Disconnected,
                    connection_type: ConnectionType::Unknown,
                });
            apply(client);
            client.clone()
        };
        self.events.dispatch(&event, &snapshot);
    }

    fn peer_connecting(&self, peer_id: &str) {
        self.update(peer_id, ProfileEvent::PeerConnecting, |c| {
            c.status = ClientStatus::Connecting
        });
    }

    fn peer_disconnected(&self, peer_id: &str) {
        if !self.clients.lock().contains_key(peer_id) {
            return;
        }
        self.update(peer_id, ProfileEvent::PeerDisconnected, |c| {
            c.status = ClientStatus::Disconnected
        });
    }

    fn connection_type_changed(&self, peer_id: &str) {
        if !self.clients.lock().contains_key(peer_id) {
            return;
        }
        let Some(connection_type) = self.module.manager().connection_type(peer_id) else {
            return;
        };
        self.update(peer_id, ProfileEvent::PeerChanged, |c| {
            c.connection_type = connection_type
        });
    }

    fn profile_changed(&self, msg: ModuleMessage) {
        let profile = match msg.data.map(|v| v.into_object::<UserProfile>()) {
            Some(Ok(profile)) => profile,
            Some(Err(e)) => {
                warn!("Invalid profile from {}: {}", msg.source_client_id, e);
                return;
            }
            None => return,
        };
        self.update(&msg.source_client_id, ProfileEvent::PeerChanged, |c| {
            c.profile = Some(profile)
        });
    }
}

async fn peer_connected(module: Weak<ProfileModule>, peer_id: String) {
    let Some(this) = module.upgrade() else {
        return;
    };
    let profile = match this.fetch_profile(&peer_id).await {
        Ok(profile) => profile,
        Err(e) => {
            debug!("No profile from {}: {}", peer_id, e);
            None
        }
    };
    let connection_type = this
        .module
        .manager()
        .connection_type(&peer_id)
        .unwrap_or_default();
    this.update(&peer_id, ProfileEvent::PeerConnected, |c| {
        c.status = ClientStatus::Connected;
        c.connection_type = connection_type;
        if profile.is_some() {
            c.profile = profile;
        }
    });
}

impl Drop for ProfileModule {
    fn drop(&mut self) {
        for subscription in self.session_subscriptions.get_mut().drain(..) {
            subscription.unsubscribe();
        }
        if let Some(subscription) = self.broadcast_subscription.get_mut().take() {
            subscription.unsubscribe();
        }
        self.module.delete_invoke_listener(GET_PROFILE);
    }
}
