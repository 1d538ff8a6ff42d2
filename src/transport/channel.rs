//! Handle to one ordered-reliable sub-channel.
//!
//! The transport driver owns the real channel. A [`DataChannel`] only keeps
//! the observable state (`ChannelState`, buffered amount) and forwards writes
//! to the driver through a [`ChannelCommand`] queue.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

/// Label of the sub-channels a pool accepts.
pub const RELIABLE_LABEL: &str = "DataChannelReliable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Request from a [`DataChannel`] to the driver that owns the transport.
#[derive(Debug)]
pub enum ChannelCommand {
    Write {
        channel: Uuid,
        data: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    Close {
        channel: Uuid,
    },
}

struct Inner {
    id: Uuid,
    label: String,
    state: watch::Sender<ChannelState>,
    buffered: watch::Sender<usize>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl DataChannel {
    /// New handle in the `Connecting` state.
    pub fn new(label: &str, commands: mpsc::UnboundedSender<ChannelCommand>) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        let (buffered, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                label: label.to_string(),
                state,
                buffered,
                commands,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Wait until the channel leaves `Connecting` and return the new state.
    pub async fn wait_open(&self) -> ChannelState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| *s != ChannelState::Connecting).await {
            Ok(state) => *state,
            Err(_) => ChannelState::Closed,
        };
        state
    }

    /// Bytes written but not yet handed to the network.
    pub fn buffered_amount(&self) -> usize {
        *self.inner.buffered.borrow()
    }

    /// Wait until the buffered amount is at or below `threshold`.
    ///
    /// Fails if the channel stops being open while waiting.
    pub async fn wait_drained(&self, threshold: usize) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let mut buffered = self.inner.buffered.subscribe();
        loop {
            if *state.borrow_and_update() != ChannelState::Open {
                return Err(Error::network(format!(
                    "channel {} closed while draining",
                    self.inner.id
                )));
            }
            if *buffered.borrow_and_update() <= threshold {
                return Ok(());
            }
            tokio::select! {
                _ = state.changed() => {}
                _ = buffered.changed() => {}
            }
        }
    }

    /// Hand one message to the transport.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::network(format!(
                "channel {} is {:?}",
                self.inner.id,
                self.state()
            )));
        }

        let (done, result) = oneshot::channel();
        self.inner
            .commands
            .send(ChannelCommand::Write {
                channel: self.inner.id,
                data,
                done,
            })
            .map_err(|_| Error::network("transport driver is gone"))?;

        result
            .await
            .map_err(|_| Error::network("transport dropped the write"))?
    }

    pub fn close(&self) {
        let state = self.state();
        if matches!(state, ChannelState::Closing | ChannelState::Closed) {
            return;
        }
        debug!("Closing data channel {} ({})", self.inner.id, self.inner.label);
        self.set_state(ChannelState::Closing);
        let sent = self.inner.commands.send(ChannelCommand::Close {
            channel: self.inner.id,
        });
        if sent.is_err() {
            self.set_state(ChannelState::Closed);
        }
    }

    /// Driver side: publish a state transition.
    pub fn set_state(&self, state: ChannelState) {
        self.inner.state.send_replace(state);
    }

    /// Driver side: publish the current buffered amount.
    pub fn set_buffered_amount(&self, amount: usize) {
        self.inner.buffered.send_replace(amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_open_returns_first_settled_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = DataChannel::new(RELIABLE_LABEL, tx);
        assert_eq!(channel.state(), ChannelState::Connecting);

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_open().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.set_state(ChannelState::Open);
        assert_eq!(waiter.await.unwrap(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_send_roundtrips_through_driver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = DataChannel::new(RELIABLE_LABEL, tx);
        channel.set_state(ChannelState::Open);

        let driver = tokio::spawn(async move {
            match rx.recv().await {
                Some(ChannelCommand::Write { data, done, .. }) => {
                    let _ = done.send(Ok(()));
                    data
                }
                other => panic!("unexpected command {:?}", other),
            }
        });

        channel.send(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(driver.await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = DataChannel::new(RELIABLE_LABEL, tx);
        let err = channel.send(Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn test_wait_drained() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = DataChannel::new(RELIABLE_LABEL, tx);
        channel.set_state(ChannelState::Open);
        channel.set_buffered_amount(100_000);

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_drained(65535).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.set_buffered_amount(1_000);
        waiter.await.unwrap().unwrap();

        channel.set_buffered_amount(100_000);
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_drained(65535).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.set_state(ChannelState::Closed);
        assert!(matches!(waiter.await.unwrap(), Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_close_without_driver_goes_straight_to_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let channel = DataChannel::new(RELIABLE_LABEL, tx);
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
