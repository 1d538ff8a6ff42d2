//! Cross-instance bus
//!
//! Every signaling instance hosting a room subscribes to that room's topic.
//! Frames are opaque bytes here; [`BusFrame`](crate::model::message::BusFrame)
//! gives them meaning. Delivery is best effort: a subscriber that falls behind
//! loses frames, and a publish with no subscribers goes nowhere.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::Result;

const TOPIC_CAPACITY: usize = 256;

pub trait Bus: Send + Sync {
    /// Post `frame` to every subscriber of `room_id`, the publisher included.
    fn publish(&self, room_id: &str, frame: Bytes) -> Result<()>;

    fn subscribe(&self, room_id: &str) -> broadcast::Receiver<Bytes>;
}

/// In-process bus shared by instances running in one process.
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}

impl Bus for LocalBus {
    fn publish(&self, room_id: &str, frame: Bytes) -> Result<()> {
        let mut topics = self.topics.lock();
        let Some(sender) = topics.get(room_id) else {
            trace!("No subscriber for room {}", room_id);
            return Ok(());
        };
        if sender.send(frame).is_err() {
            // every receiver is gone
            topics.remove(room_id);
        }
        Ok(())
    }

    fn subscribe(&self, room_id: &str) -> broadcast::Receiver<Bytes> {
        self.topics
            .lock()
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_room_subscribers_only() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("r1");
        let mut b = bus.subscribe("r1");
        let mut other = bus.subscribe("r2");

        bus.publish("r1", Bytes::from_static(b"hello")).unwrap();
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_topic_is_dropped() {
        let bus = LocalBus::new();
        bus.publish("nobody", Bytes::from_static(b"x")).unwrap();
        assert_eq!(bus.topic_count(), 0);

        let rx = bus.subscribe("r1");
        assert_eq!(bus.topic_count(), 1);
        drop(rx);
        bus.publish("r1", Bytes::from_static(b"x")).unwrap();
        assert_eq!(bus.topic_count(), 0);
    }
}
