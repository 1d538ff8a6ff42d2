//! `file` namespace: offer a named buffer to peers.
//!
//! The sender broadcasts `file-metadata` and serves the bytes from an invoke
//! handler registered under a random secret until the offer expires. Each
//! receiver fetches the bytes by invoking that secret on the sender and
//! reports the fetch's progress in chunks as they arrive.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::module::{Module, ModuleMessage};
use super::{BroadcastMessage, InvokeProgress, SessionManager};
use crate::transport::TransferProgress;
use crate::emitter::{Emitter, Subscription};
use crate::model::payload::Value;
use crate::util::{now_millis, random_id};
use crate::{Error, Result};

const NAMESPACE: &str = "file";
const FILE_METADATA: &str = "file-metadata";

pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub filename: String,
    pub size: u64,
    pub secret: String,
    /// Milliseconds since the UNIX epoch
    pub expiry_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Progress,
    Received,
    Failed,
}

#[derive(Debug, Clone)]
pub enum FileEvent {
    /// Chunks of the body received so far
    Progress {
        filename: String,
        source_client_id: String,
        received_chunks: usize,
        total_chunks: usize,
    },
    Received {
        filename: String,
        source_client_id: String,
        data: Bytes,
    },
    Failed {
        filename: String,
        source_client_id: String,
        reason: String,
    },
}

pub struct FileModule {
    module: Module,
    events: Arc<Emitter<FileEventKind, FileEvent>>,
    subscription: Mutex<Option<Subscription<String, BroadcastMessage>>>,
}

impl FileModule {
    pub fn new(manager: Arc<SessionManager>) -> Result<Self> {
        let module = Module::new(NAMESPACE, manager)?;
        let events = Arc::new(Emitter::new());

        let fetcher = module.clone();
        let emitter = events.clone();
        let subscription = module.add_broadcast_listener(FILE_METADATA, move |msg: ModuleMessage| {
            let metadata = match msg.data.map(|v| v.into_object::<FileMetadata>()) {
                Some(Ok(metadata)) => metadata,
                Some(Err(e)) => {
                    warn!("Invalid file offer from {}: {}", msg.source_client_id, e);
                    return;
                }
                None => return,
            };
            tokio::spawn(fetch(
                fetcher.clone(),
                emitter.clone(),
                msg.source_client_id,
                metadata,
            ));
        });

        Ok(Self {
            module,
            events,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn events(&self) -> &Emitter<FileEventKind, FileEvent> {
        &self.events
    }

    /// Offer `data` as `filename` to `peers` (default: every peer).
    ///
    /// Returns the number of peers the offer reached. The bytes stay available
    /// for `timeout` (default 30 s).
    pub async fn send(
        &self,
        filename: &str,
        data: Bytes,
        timeout: Option<Duration>,
        peers: Option<Vec<String>>,
    ) -> Result<usize> {
        let timeout = timeout.unwrap_or(DEFAULT_OFFER_TIMEOUT);
        let secret = random_id(16);
        let metadata = FileMetadata {
            filename: filename.to_string(),
            size: data.len() as u64,
            secret: secret.clone(),
            expiry_time: now_millis() + timeout.as_millis() as u64,
        };

        // Registered before the offer goes out so an early fetch finds it.
        self.module.set_invoke_listener(&secret, move |_| {
            let data = data.clone();
            async move { Ok(Some(Value::Bytes(data))) }
        });

        let expiring = self.module.clone();
        let expired = secret.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expiring.delete_invoke_listener(&expired);
        });

        let offered = self
            .module
            .broadcast(FILE_METADATA, Some(Value::object(&metadata)?), peers)
            .await?;
        info!("Offered {} ({} bytes) to {} peer(s)", filename, metadata.size, offered);
        Ok(offered)
    }
}

async fn fetch(
    module: Module,
    events: Arc<Emitter<FileEventKind, FileEvent>>,
    source: String,
    metadata: FileMetadata,
) {
    let remaining = Duration::from_millis(metadata.expiry_time.saturating_sub(now_millis()));
    let progress = InvokeProgress {
        on_response: Some(Arc::new({
            let events = events.clone();
            let filename = metadata.filename.clone();
            let source = source.clone();
            move |progress: &TransferProgress| {
                events.dispatch(
                    &FileEventKind::Progress,
                    &FileEvent::Progress {
                        filename: filename.clone(),
                        source_client_id: source.clone(),
                        received_chunks: progress.transferred,
                        total_chunks: progress.total,
                    },
                );
            }
        })),
        ..Default::default()
    };
    let result = match tokio::time::timeout(
        remaining,
        module.invoke_with_progress(&metadata.secret, None, &source, progress),
    )
    .await
    {
        Ok(Ok(Some(Value::Bytes(data)))) => Ok(data),
        Ok(Ok(Some(_))) => Err(Error::protocol("file body is not binary")),
        Ok(Ok(None)) => Err(Error::protocol("file is no longer offered")),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Timeout(remaining.as_millis() as u64)),
    };

    match result {
        Ok(data) => {
            info!("Received {} ({} bytes) from {}", metadata.filename, data.len(), source);
            events.dispatch(
                &FileEventKind::Received,
                &FileEvent::Received {
                    filename: metadata.filename,
                    source_client_id: source,
                    data,
                },
            );
        }
        Err(e) => {
            warn!("Fetching {} from {} failed: {}", metadata.filename, source, e);
            events.dispatch(
                &FileEventKind::Failed,
                &FileEvent::Failed {
                    filename: metadata.filename,
                    source_client_id: source,
                    reason: e.to_string(),
                },
            );
        }
    }
}

impl Drop for FileModule {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_wire_shape() {
        let metadata = FileMetadata {
            filename: "a.txt".into(),
            size: 3,
            secret: "s".into(),
            expiry_time: 10,
        };
        assert_eq!(
            serde_json::to_value(&metadata).unwrap(),
            json!({"filename": "a.txt", "size": 3, "secret": "s", "expiryTime": 10})
        );
    }
}
