//! Invoke/broadcast framing inside a sub-channel payload.
//!
//! A message is an envelope-packed `[header, body?]` where the header is JSON:
//!
//! ```json
//! {"name":"invoke","args":{"handlerId":"file/x","replyId":"file/x:reply:k3j2","replyStreamId":7}}
//! {"name":"invoke","args":{"handlerId":"file/x:reply:k3j2"}}
//! {"name":"broadcast","args":{"event":"message/message"}}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::model::payload::{pack, unpack};
use crate::util::random_id;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "lowercase")]
pub enum Header {
    Invoke(InvokeArgs),
    Broadcast(BroadcastArgs),
}

/// A request when `reply_id` is set, otherwise the reply to `handler_id`.
///
/// A request may name the stream id its reply should travel on, so the
/// caller can follow the reply's chunks as they arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeArgs {
    pub handler_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_stream_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastArgs {
    pub event: String,
}

impl Header {
    pub fn request(handler_id: &str, reply_id: &str, reply_stream_id: u32) -> Self {
        Header::Invoke(InvokeArgs {
            handler_id: handler_id.to_string(),
            reply_id: Some(reply_id.to_string()),
            reply_stream_id: Some(reply_stream_id),
        })
    }

    pub fn reply(reply_id: &str) -> Self {
        Header::Invoke(InvokeArgs {
            handler_id: reply_id.to_string(),
            reply_id: None,
            reply_stream_id: None,
        })
    }

    pub fn broadcast(event: &str) -> Self {
        Header::Broadcast(BroadcastArgs {
            event: event.to_string(),
        })
    }
}

/// Reply id for a new invoke of `event`.
pub fn reply_id(event: &str) -> String {
    format!("{}:reply:{}", event, random_id(11))
}

pub fn encode_message(header: &Header, body: Option<&Bytes>) -> Result<Bytes> {
    let header = Bytes::from(serde_json::to_vec(header)?);
    match body {
        Some(body) => pack(&[header, body.clone()]),
        None => pack(&[header]),
    }
}

pub fn decode_message(data: &Bytes) -> Result<(Header, Option<Bytes>)> {
    let mut parts = unpack(data)?.into_iter();
    let header = parts
        .next()
        .ok_or_else(|| Error::malformed("message without a header"))?;
    let header: Header = serde_json::from_slice(&header)?;
    Ok((header, parts.next()))
}
