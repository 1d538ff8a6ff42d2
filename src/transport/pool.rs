//! Sub-channel pool
//!
//! Presents the sub-channels of one peer as a single pipe. Outgoing buffers
//! are chunked and scheduled onto the least loaded open channel; every channel
//! carries one transfer at a time, further senders queue in arrival order.
//! Incoming chunks are grouped by stream id and handed out as
//! [`ReceivedData`] once a stream is complete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::channel::{ChannelState, DataChannel, RELIABLE_LABEL};
use crate::config::TransferConfig;
use crate::emitter::Emitter;
use crate::model::chunk::{self, ChunkStream};
use crate::{Error, Result};

/// A reassembled inbound buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedData {
    pub bytes: Bytes,
    pub stream_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEvent {
    /// Outbound bytes handed to a sub-channel
    Enqueue,
    /// Inbound chunks accumulated for a stream
    ReceivedChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub stream_id: u32,
    pub transferred: usize,
    pub total: usize,
}

#[derive(Clone)]
struct PoolChannel {
    channel: DataChannel,
    /// Payload bytes scheduled on this channel and not yet written
    pending: Arc<AtomicUsize>,
    /// One transfer at a time; tokio's mutex queues waiters fairly
    queue: Arc<tokio::sync::Mutex<()>>,
}

pub struct ChannelPool {
    peer_id: String,
    config: TransferConfig,
    channels: Mutex<Vec<PoolChannel>>,
    streams: Mutex<HashMap<u32, Vec<Bytes>>>,
    received: mpsc::UnboundedSender<ReceivedData>,
    events: Emitter<PoolEvent, TransferProgress>,
    closed: AtomicBool,
}

impl ChannelPool {
    pub fn new(
        peer_id: &str,
        config: TransferConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ReceivedData>) {
        let (received, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            peer_id: peer_id.to_string(),
            config,
            channels: Mutex::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
            received,
            events: Emitter::new(),
            closed: AtomicBool::new(false),
        });
        (pool, rx)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn events(&self) -> &Emitter<PoolEvent, TransferProgress> {
        &self.events
    }

    /// Admit a sub-channel. Channels with a foreign label are ignored.
    pub fn add_channel(&self, channel: DataChannel) -> bool {
        if channel.label() != RELIABLE_LABEL {
            debug!(
                "Peer {}: ignoring data channel with label '{}'",
                self.peer_id,
                channel.label()
            );
            return false;
        }
        if self.closed.load(Ordering::SeqCst) {
            channel.close();
            return false;
        }

        info!("Peer {}: sub-channel {} added", self.peer_id, channel.id());
        self.channels.lock().push(PoolChannel {
            channel,
            pending: Arc::new(AtomicUsize::new(0)),
            queue: Arc::new(tokio::sync::Mutex::new(())),
        });
        true
    }

    /// Whether any sub-channel is open.
    pub fn is_open(&self) -> bool {
        self.channels.lock().iter().any(|c| c.channel.is_open())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Send `data` as one chunked stream.
    ///
    /// Resolves once the last chunk was handed to the transport. Any transport
    /// failure aborts the whole stream.
    pub async fn send(&self, data: Bytes, stream_id: Option<u32>) -> Result<()> {
        let mut stream = ChunkStream::split(data, self.config.chunk_size, stream_id)?;
        let target = self.schedule().await?;
        let total = stream.byte_len();
        target.pending.fetch_add(total, Ordering::SeqCst);

        let mut written = 0;
        let result = {
            let _turn = target.queue.lock().await;
            self.transmit(&target, &mut stream, &mut written).await
        };

        // Whatever was not written no longer counts against the channel.
        if total > written {
            target.pending.fetch_sub(total - written, Ordering::SeqCst);
        }

        if let Err(e) = &result {
            warn!(
                "Peer {}: stream {} failed after {}/{} bytes: {}",
                self.peer_id,
                stream.stream_id(),
                written,
                total,
                e
            );
        }
        result
    }

    async fn transmit(
        &self,
        target: &PoolChannel,
        stream: &mut ChunkStream,
        written: &mut usize,
    ) -> Result<()> {
        let channel = &target.channel;
        let total = stream.byte_len();
        while !stream.is_end() {
            let before = stream.bytes_taken();
            let Some(chunk) = stream.next_chunk() else {
                break;
            };
            channel.send(chunk).await?;
            let sent = stream.bytes_taken() - before;
            target.pending.fetch_sub(sent, Ordering::SeqCst);
            *written += sent;

            if channel.buffered_amount() > self.config.low_water_mark {
                channel.wait_drained(self.config.low_water_mark).await?;
                self.events.dispatch(
                    &PoolEvent::Enqueue,
                    &TransferProgress {
                        stream_id: stream.stream_id(),
                        transferred: stream.bytes_taken(),
                        total,
                    },
                );
            }
        }

        self.events.dispatch(
            &PoolEvent::Enqueue,
            &TransferProgress {
                stream_id: stream.stream_id(),
                transferred: total,
                total,
            },
        );
        Ok(())
    }

    /// Pick the open sub-channel with the least pending bytes.
    async fn schedule(&self) -> Result<PoolChannel> {
        let known: Vec<DataChannel> = self
            .channels
            .lock()
            .iter()
            .map(|c| c.channel.clone())
            .collect();
        for channel in &known {
            channel.wait_open().await;
        }

        let mut channels = self.channels.lock();
        channels.retain(|c| {
            !matches!(
                c.channel.state(),
                ChannelState::Closing | ChannelState::Closed
            )
        });

        let mut best: Option<&PoolChannel> = None;
        for candidate in channels.iter().filter(|c| c.channel.is_open()) {
            let load = candidate.pending.load(Ordering::SeqCst);
            match best {
                Some(b) if b.pending.load(Ordering::SeqCst) <= load => {}
                _ => best = Some(candidate),
            }
        }
        best.cloned().ok_or(Error::NoChannelAvailable)
    }

    /// Accept one chunk from any sub-channel.
    pub fn handle_chunk(&self, chunk: Bytes) {
        let meta = match chunk::metadata(&chunk) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Peer {}: dropping chunk: {}", self.peer_id, e);
                return;
            }
        };

        let (received, complete) = {
            let mut streams = self.streams.lock();
            let buffer = streams.entry(meta.stream_id).or_default();
            buffer.push(chunk);
            let received = buffer.len();
            let complete = if received >= meta.chunk_count as usize {
                streams.remove(&meta.stream_id)
            } else {
                None
            };
            (received, complete)
        };

        self.events.dispatch(
            &PoolEvent::ReceivedChunk,
            &TransferProgress {
                stream_id: meta.stream_id,
                transferred: received,
                total: meta.chunk_count as usize,
            },
        );

        let Some(chunks) = complete else {
            return;
        };
        match chunk::restore(&chunks) {
            Ok(bytes) => {
                debug!(
                    "Peer {}: stream {} complete, {} bytes, latency {}ms",
                    self.peer_id,
                    meta.stream_id,
                    bytes.len(),
                    meta.latency_millis
                );
                let _ = self.received.send(ReceivedData {
                    bytes,
                    stream_id: meta.stream_id,
                });
            }
            Err(e) => warn!(
                "Peer {}: stream {} failed to restore: {}",
                self.peer_id, meta.stream_id, e
            ),
        }
    }

    /// Close every sub-channel. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<PoolChannel> = std::mem::take(&mut *self.channels.lock());
        for c in channels {
            c.channel.close();
        }
        info!("Peer {}: sub-channel pool closed", self.peer_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
