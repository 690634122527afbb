//! Content-change events and the transports that deliver them.

mod jsonl;
#[cfg(feature = "kafka")]
mod kafka;

use async_trait::async_trait;
use serde_json::Value;

use crate::store::ContentId;

pub use jsonl::JsonlSource;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaParams, KafkaSource};

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed event: {0}")]
    Malformed(String),

    /// Transient transport fault. The consumer backs off and polls again.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EventError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventError::Transport(_))
    }
}

/// A validated content-change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEvent {
    pub content_id: ContentId,
    pub title: String,
    pub content: String,
}

impl ContentEvent {
    /// Decode a raw payload. The id is read from `postId`, then `post_id`.
    pub fn parse(payload: &[u8]) -> Result<Self, EventError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| EventError::Malformed(format!("invalid json: {}", err)))?;

        let object = value
            .as_object()
            .ok_or_else(|| EventError::Malformed("payload is not a json object".to_string()))?;

        let raw_id = ["postId", "post_id"]
            .iter()
            .filter_map(|key| object.get(*key))
            .find(|value| !value.is_null())
            .ok_or_else(|| EventError::Malformed("missing post id".to_string()))?;

        let id = parse_id(raw_id)?;

        Ok(Self {
            content_id: ContentId::new(id),
            title: text_field(object.get("title"), "title")?,
            content: text_field(object.get("content"), "content")?,
        })
    }
}

fn parse_id(value: &Value) -> Result<i64, EventError> {
    let id = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| EventError::Malformed(format!("post id is not an integer: {}", value)))?;

    if id <= 0 {
        return Err(EventError::Malformed(format!("post id must be positive, got {}", id)));
    }
    Ok(id)
}

fn text_field(value: Option<&Value>, name: &str) -> Result<String, EventError> {
    match value {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(other) => Err(EventError::Malformed(format!(
            "{} must be a string, got {}",
            name, other
        ))),
    }
}

/// One undecoded message and where it came from.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub payload: Vec<u8>,
    /// Human-readable transport position for logs (`topic/partition@offset`, `file:12`).
    pub position: String,
}

/// An ordered, at-least-once stream of raw events.
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next event. `Ok(None)` means the source is exhausted.
    async fn next_event(&mut self) -> Result<Option<RawEvent>, EventError>;

    /// Mark `event` as processed so it is not redelivered after a restart.
    async fn ack(&mut self, event: &RawEvent) -> Result<(), EventError>;
}

#[async_trait]
impl<S: EventSource + ?Sized> EventSource for Box<S> {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, EventError> {
        (**self).next_event().await
    }

    async fn ack(&mut self, event: &RawEvent) -> Result<(), EventError> {
        (**self).ack(event).await
    }
}
