use crate::session::SessionState;

/// Failure to open the upstream completion stream.
///
/// Always raised before any fragment reaches the relay, so the caller can show
/// a failure message in place of an answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Client configuration was rejected before a request was attempted.
    #[error("client config error: {0}")]
    Config(String),
    /// The request could not be sent or no response headers arrived.
    #[error("upstream request failed: {0}")]
    Request(String),
    /// The upstream API answered with a non-success status.
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
}

impl ConnectionError {
    /// Returns the upstream HTTP status when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// I/O failure while reading the already-open upstream body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Malformed event-stream framing.
///
/// `line` is the 1-based line number within the session's byte stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("line {line}: missing ':' field separator in {content:?}")]
    MissingSeparator { line: u64, content: String },
    #[error("line {line}: not valid UTF-8")]
    InvalidUtf8 { line: u64 },
}

/// A data payload that cannot be interpreted as a completion chunk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    /// The payload is not JSON or not a JSON object.
    #[error("malformed completion chunk: {message}")]
    Malformed { message: String },
    /// The provider embedded an error object in the stream.
    #[error("provider reported an error: {message}")]
    Provider { message: String },
}

impl ExtractionError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }
}

/// Misuse of a fragment sink, or a sink whose consumer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// `append`, `close` or `fail` was called after the sink already terminated.
    #[error("relay already terminated")]
    Terminated,
    /// The consuming side was dropped.
    #[error("relay consumer disconnected")]
    ConsumerGone,
}

/// Attempted to move a session out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Terminal reason of a failed session, as seen by the relay consumer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFailure {
    #[error("decode failure: {message}")]
    Decode { message: String },
    #[error("extraction failure: {message}")]
    Extraction { message: String },
    #[error("transport failure: {message}")]
    Transport { message: String },
    /// The caller aborted the session or the consumer disconnected.
    #[error("session cancelled")]
    Cancelled,
    /// The producing side vanished without signalling completion or failure.
    #[error("relay interrupted before a terminal signal")]
    Interrupted,
}

impl From<&DecodeError> for SessionFailure {
    fn from(value: &DecodeError) -> Self {
        Self::Decode {
            message: value.to_string(),
        }
    }
}

impl From<&ExtractionError> for SessionFailure {
    fn from(value: &ExtractionError) -> Self {
        Self::Extraction {
            message: value.to_string(),
        }
    }
}

/// Top-level error type for the chat API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Invalid question or options.
    #[error("validation error: {0}")]
    Validation(String),
    /// Upstream connection could not be established.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The session started but ended in the `Error` state.
    #[error(transparent)]
    Failed(SessionFailure),
    /// Internal invariant violation (for example a session task that vanished).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChatError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<SessionFailure> for ChatError {
    fn from(value: SessionFailure) -> Self {
        ChatError::Failed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_failure_serializes_with_kind_tag() {
        let value = serde_json::to_value(SessionFailure::Decode {
            message: "bad".into(),
        })
        .expect("serialize");
        assert_eq!(value["kind"], "decode");
        assert_eq!(value["message"], "bad");

        let cancelled = serde_json::to_value(SessionFailure::Cancelled).expect("serialize");
        assert_eq!(cancelled, serde_json::json!({"kind": "cancelled"}));
    }

    #[test]
    fn connection_error_exposes_status() {
        let err = ConnectionError::Status {
            status: 429,
            body: "slow down".into(),
        };
        assert_eq!(err.status(), Some(429));
        assert_eq!(ConnectionError::Request("x".into()).status(), None);
        assert!(ChatError::from(err).to_string().contains("429"));
    }
}
