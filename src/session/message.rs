//! `message` namespace: plain text broadcast to peers.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::module::{Module, ModuleMessage};
use super::{BroadcastMessage, SessionManager};
use crate::emitter::{Emitter, Subscription};
use crate::model::payload::Value;
use crate::Result;

const NAMESPACE: &str = "message";
const MESSAGE: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub source_client_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageEvent {
    Received,
}

pub struct MessageModule {
    module: Module,
    events: Arc<Emitter<MessageEvent, ChatMessage>>,
    subscription: Mutex<Option<Subscription<String, BroadcastMessage>>>,
}

impl MessageModule {
    pub fn new(manager: Arc<SessionManager>) -> Result<Self> {
        let module = Module::new(NAMESPACE, manager)?;
        let events = Arc::new(Emitter::new());

        let emitter = events.clone();
        let subscription = module.add_broadcast_listener(MESSAGE, move |msg: ModuleMessage| {
            let text = match msg.data {
                Some(Value::String(text)) => text,
                other => {
                    warn!("Unexpected message body from {}: {:?}", msg.source_client_id, other);
                    return;
                }
            };
            info!("Message from {}: {}", msg.source_client_id, text);
            emitter.dispatch(
                &MessageEvent::Received,
                &ChatMessage {
                    source_client_id: msg.source_client_id,
                    text,
                },
            );
        });

        Ok(Self {
            module,
            events,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn events(&self) -> &Emitter<MessageEvent, ChatMessage> {
        &self.events
    }

    /// Broadcast `text` to every connected peer.
    pub async fn send(&self, text: &str) -> Result<usize> {
        self.module
            .broadcast(MESSAGE, Some(Value::from(text)), None)
            .await
    }
}

impl Drop for MessageModule {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}
