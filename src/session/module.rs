use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use super::{BroadcastMessage, InvokeProgress, InvokeRequest, ProgressHandler, SessionManager};
use crate::emitter::Subscription;
use crate::model::payload::{self, Value};
use crate::{Error, Result};

/// An invoke delivered to a module handler, body already decoded.
#[derive(Debug, Clone)]
pub struct ModuleRequest {
    pub event: String,
    pub source_client_id: String,
    pub data: Option<Value>,
}

/// A broadcast delivered to a module listener, body already decoded.
#[derive(Debug, Clone)]
pub struct ModuleMessage {
    pub event: String,
    pub source_client_id: String,
    pub data: Option<Value>,
}

/// A feature namespace on top of a [`SessionManager`].
///
/// Event names are scoped as `"{namespace}/{event}"` and bodies travel as
/// tagged [`Value`]s.
#[derive(Clone)]
pub struct Module {
    namespace: String,
    manager: Arc<SessionManager>,
}

impl Module {
    pub fn new(namespace: &str, manager: Arc<SessionManager>) -> Result<Self> {
        if namespace.is_empty() || namespace.contains('/') {
            return Err(Error::protocol(format!("invalid namespace '{}'", namespace)));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            manager,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn scoped(&self, event: &str) -> String {
        format!("{}/{}", self.namespace, event)
    }

    pub async fn invoke(&self, event: &str, data: Option<Value>, target: &str) -> Result<Option<Value>> {
        self.invoke_with_progress(event, data, target, InvokeProgress::default())
            .await
    }

    pub async fn invoke_with_progress(
        &self,
        event: &str,
        data: Option<Value>,
        target: &str,
        progress: InvokeProgress,
    ) -> Result<Option<Value>> {
        let body = data.as_ref().map(payload::encode).transpose()?;
        let reply = self
            .manager
            .invoke_with_progress(&self.scoped(event), body, target, progress)
            .await?;
        decode_body(reply)
    }

    pub fn set_invoke_listener<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(ModuleRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.manager
            .set_invoke_listener(&self.scoped(event), decoding(handler));
    }

    pub fn set_invoke_listener_with_progress<F, Fut>(
        &self,
        event: &str,
        handler: F,
        on_reply_progress: ProgressHandler,
    ) where
        F: Fn(ModuleRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.manager.set_invoke_listener_with_progress(
            &self.scoped(event),
            decoding(handler),
            on_reply_progress,
        );
    }

    pub fn delete_invoke_listener(&self, event: &str) {
        self.manager.delete_invoke_listener(&self.scoped(event));
    }

    pub async fn broadcast(&self, event: &str, data: Option<Value>, peers: Option<Vec<String>>) -> Result<usize> {
        let body = data.as_ref().map(payload::encode).transpose()?;
        self.manager
            .broadcast(&self.scoped(event), body, peers)
            .await
    }

    pub fn add_broadcast_listener<F>(&self, event: &str, handler: F) -> Subscription<String, BroadcastMessage>
    where
        F: Fn(ModuleMessage) + Send + Sync + 'static,
    {
        self.manager
            .add_broadcast_listener(&self.scoped(event), move |msg: &BroadcastMessage| {
                let data = match decode_body(msg.data.clone()) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Dropping {} from {}: {}", msg.event, msg.source_client_id, e);
                        return;
                    }
                };
                handler(ModuleMessage {
                    event: msg.event.clone(),
                    source_client_id: msg.source_client_id.clone(),
                    data,
                })
            })
    }
}

/// Wrap a [`Value`] handler into a raw bytes handler.
fn decoding<F, Fut>(
    handler: F,
) -> impl Fn(InvokeRequest) -> BoxFuture<'static, Result<Option<Bytes>>> + Send + Sync + 'static
where
    F: Fn(ModuleRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    let handler = Arc::new(handler);
    move |req: InvokeRequest| {
        let handler = handler.clone();
        async move {
            let request = ModuleRequest {
                event: req.event,
                source_client_id: req.source_client_id,
                data: decode_body(req.data)?,
            };
            let result = handler(request).await?;
            result.as_ref().map(payload::encode).transpose()
        }
        .boxed()
    }
}

fn decode_body(body: Option<Bytes>) -> Result<Option<Value>> {
    body.map(|b| payload::decode(&b)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_validation() {
        let manager = SessionManager::new("me");
        assert!(Module::new("", manager.clone()).is_err());
        assert!(Module::new("a/b", manager.clone()).is_err());
        let module = Module::new("file", manager).unwrap();
        assert_eq!(module.scoped("file-metadata"), "file/file-metadata");
    }

    #[tokio::test]
    async fn test_invoke_self_roundtrips_values() {
        let manager = SessionManager::new("me");
        let module = Module::new("math", manager).unwrap();
        module.set_invoke_listener("double", |req: ModuleRequest| async move {
            match req.data {
                Some(Value::Number(n)) => Ok(Some(Value::Number(n * 2.0))),
                _ => Err(Error::protocol("expected a number")),
            }
        });

        let reply = module
            .invoke("double", Some(Value::Number(21.0)), "me")
            .await
            .unwrap();
        assert_eq!(reply, Some(Value::Number(42.0)));

        module.delete_invoke_listener("double");
        assert_eq!(module.invoke("double", None, "me").await.unwrap(), None);
    }
}
