use std::fmt;

use bytes::Bytes;

use crate::decoder::{StreamEvent, StreamEventKind};
use crate::errors::ExtractionError;

/// `data` payload the provider sends to mark the end of a completion.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One incremental text fragment of the answer.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ChatDelta(String);

impl ChatDelta {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// UTF-8 bytes as delivered to relay consumers.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.0)
    }
}

impl fmt::Display for ChatDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatDelta {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Result of interpreting one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// A non-empty text fragment.
    Delta(ChatDelta),
    /// Nothing visible in this event (heartbeat, role-only or finish chunk).
    Skip,
    /// The end-of-stream sentinel.
    Done,
}

/// Maps an event to its text fragment, the completion signal, or nothing.
///
/// Only `choices[0].delta.content` is read. A payload that is not a JSON
/// object, or that carries an `error` object, is fatal.
pub fn extract(event: &StreamEvent) -> Result<Extraction, ExtractionError> {
    if event.kind == StreamEventKind::RetryHint {
        return Ok(Extraction::Skip);
    }
    let data = event.data.trim();
    if data == DONE_SENTINEL {
        return Ok(Extraction::Done);
    }

    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ExtractionError::malformed(format!("invalid JSON payload: {e}")))?;
    if !value.is_object() {
        return Err(ExtractionError::malformed("payload is not a JSON object"));
    }

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| error.as_str())
            .unwrap_or("completion stream error");
        return Err(ExtractionError::provider(message));
    }

    let content = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|content| content.as_str());

    match content {
        Some(text) if !text.is_empty() => Ok(Extraction::Delta(ChatDelta::new(text))),
        _ => Ok(Extraction::Skip),
    }
}
