//! Chunk codec
//!
//! Large buffers are cut into chunks that fit one sub-channel message. Every
//! chunk carries a 20 byte header:
//!
//! ```text
//! u32 stream id | u32 chunk index | u32 chunk count | u64 emitted at (ms)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::now_millis;
use crate::{Error, Result};

pub const HEADER_SIZE: usize = 20;

/// Header fields of one chunk plus its observed latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub stream_id: u32,
    pub index: u32,
    pub chunk_count: u32,
    pub latency_millis: u64,
}

/// Sender side of a chunked transfer.
#[derive(Debug)]
pub struct ChunkStream {
    data: Bytes,
    payload_size: usize,
    stream_id: u32,
    chunk_count: u32,
    index: u32,
}

impl ChunkStream {
    /// Prepare `data` for chunking. Without a `stream_id` a random one is drawn.
    ///
    /// An empty buffer still yields one (header only) chunk so the receiver
    /// sees the end of the stream.
    pub fn split(data: Bytes, chunk_size: usize, stream_id: Option<u32>) -> Result<Self> {
        if chunk_size <= HEADER_SIZE {
            return Err(Error::InvalidChunkSize(chunk_size));
        }
        let payload_size = chunk_size - HEADER_SIZE;
        let chunk_count = data.len().div_ceil(payload_size).max(1);
        let chunk_count = u32::try_from(chunk_count)
            .map_err(|_| Error::protocol(format!("{} bytes need too many chunks", data.len())))?;

        Ok(Self {
            data,
            payload_size,
            stream_id: stream_id.unwrap_or_else(rand::random),
            chunk_count,
            index: 0,
        })
    }

    /// Next chunk on the wire, `None` once the stream is exhausted.
    pub fn next_chunk(&mut self) -> Option<Bytes> {
        if self.is_end() {
            return None;
        }
        let start = self.index as usize * self.payload_size;
        let end = (start + self.payload_size).min(self.data.len());
        let body = &self.data[start.min(end)..end];

        let mut chunk = BytesMut::with_capacity(HEADER_SIZE + body.len());
        chunk.put_u32(self.stream_id);
        chunk.put_u32(self.index);
        chunk.put_u32(self.chunk_count);
        chunk.put_u64(now_millis());
        chunk.put_slice(body);

        self.index += 1;
        Some(chunk.freeze())
    }

    pub fn is_end(&self) -> bool {
        self.index >= self.chunk_count
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Index of the next chunk to be taken.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Total payload bytes of the stream.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Payload bytes handed out so far.
    pub fn bytes_taken(&self) -> usize {
        (self.index as usize * self.payload_size).min(self.data.len())
    }
}

impl Iterator for ChunkStream {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        self.next_chunk()
    }
}

/// Read the header of `chunk`.
pub fn metadata(chunk: &[u8]) -> Result<ChunkMetadata> {
    if chunk.len() < HEADER_SIZE {
        return Err(Error::malformed(format!(
            "chunk of {} bytes is shorter than its header",
            chunk.len()
        )));
    }
    let mut header = &chunk[..HEADER_SIZE];
    let stream_id = header.get_u32();
    let index = header.get_u32();
    let chunk_count = header.get_u32();
    let emitted_at = header.get_u64();

    Ok(ChunkMetadata {
        stream_id,
        index,
        chunk_count,
        latency_millis: now_millis().saturating_sub(emitted_at),
    })
}

/// Rebuild the original buffer from the chunks of one stream, in any order.
pub fn restore(chunks: &[Bytes]) -> Result<Bytes> {
    let mut indexed = chunks
        .iter()
        .map(|chunk| Ok((metadata(chunk)?.index, chunk)))
        .collect::<Result<Vec<_>>>()?;
    indexed.sort_by_key(|(index, _)| *index);

    let len = indexed.iter().map(|(_, c)| c.len() - HEADER_SIZE).sum();
    let mut out = BytesMut::with_capacity(len);
    for (_, chunk) in indexed {
        out.put_slice(&chunk[HEADER_SIZE..]);
    }
    Ok(out.freeze())
}
