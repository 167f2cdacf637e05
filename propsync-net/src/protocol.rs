//! Wire protocol.
//!
//! Every message is a two-frame multipart: frame 1 is the UTF-8 topic (a path
//! starting with `/` or a command starting with `>`), frame 2 is the
//! MessagePack-encoded [`SyncValue`].

use propsync_types::{Command, SyncValue};

use crate::error::{Result, SyncError};
use crate::framing::Multipart;

/// Topic prefixes the receiver accepts.
pub const SUBSCRIBED_PREFIXES: [&str; 2] = ["/", ">"];

/// A decoded message waiting in the inbound queue.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: SyncValue,
}

pub fn encode_payload(value: &SyncValue) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

pub fn decode_payload(bytes: &[u8]) -> Result<SyncValue> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Build the frames for `topic` carrying `value`.
pub fn encode_message(topic: &str, value: &SyncValue) -> Result<Multipart> {
    Ok(vec![topic.as_bytes().to_vec(), encode_payload(value)?])
}

/// Build the frames announcing `path` to every pending poll request.
pub fn publish_path_message(path: &str) -> Result<Multipart> {
    encode_message(Command::PublishPath.topic(), &SyncValue::Text(path.to_string()))
}

/// True if a subscriber should accept a message on `topic`.
pub fn is_subscribed(topic: &[u8]) -> bool {
    SUBSCRIBED_PREFIXES
        .iter()
        .any(|prefix| topic.starts_with(prefix.as_bytes()))
}

pub fn decode_message(mut frames: Multipart) -> Result<InboundMessage> {
    if frames.len() != 2 {
        return Err(SyncError::Malformed(format!(
            "expected 2 frames, got {}",
            frames.len()
        )));
    }
    let payload = frames.pop().unwrap_or_default();
    let topic = frames.pop().unwrap_or_default();

    let topic = String::from_utf8(topic)
        .map_err(|e| SyncError::Malformed(format!("topic is not UTF-8: {}", e)))?;
    let payload = decode_payload(&payload)?;
    Ok(InboundMessage { topic, payload })
}
