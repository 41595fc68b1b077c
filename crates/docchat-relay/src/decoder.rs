//! Incremental `text/event-stream` decoder.
//!
//! Bytes are pushed in whatever chunks the transport delivers; complete events
//! come out in wire order. Partial lines and partial events are buffered until
//! their terminator arrives, so the decoded output does not depend on where
//! chunk boundaries fall.

use crate::errors::DecodeError;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Kind of a decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    /// A dispatched event carrying one or more `data` lines.
    Message,
    /// A `retry:` field; `data` holds the reconnect interval in milliseconds.
    RetryHint,
}

/// One event decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    /// Value of the `event:` field, if the frame had one.
    pub event: Option<String>,
    /// Last `id:` seen on the stream at dispatch time.
    pub id: Option<String>,
    pub data: String,
}

impl StreamEvent {
    /// Creates an unnamed message event.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            kind: StreamEventKind::Message,
            event: None,
            id: None,
            data: data.into(),
        }
    }

    /// Creates a retry hint for the given interval.
    pub fn retry_hint(millis: u64) -> Self {
        Self {
            kind: StreamEventKind::RetryHint,
            event: None,
            id: None,
            data: millis.to_string(),
        }
    }

    /// Returns the reconnect interval when this is a retry hint.
    pub fn retry_millis(&self) -> Option<u64> {
        match self.kind {
            StreamEventKind::RetryHint => self.data.parse().ok(),
            StreamEventKind::Message => None,
        }
    }
}

/// Stateful decoder for a single stream. Not restartable.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    line: Vec<u8>,
    // Previous chunk ended in '\r'; a leading '\n' belongs to that terminator.
    skip_lf: bool,
    line_no: u64,
    data: String,
    has_data: bool,
    event: Option<String>,
    last_id: Option<String>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every event (or framing error) it completes.
    ///
    /// Results are in wire order: events decoded before a malformed line are
    /// returned ahead of its `DecodeError`. The malformed line is dropped and
    /// the decoder remains usable.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, DecodeError>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        if self.skip_lf && !rest.is_empty() {
            self.skip_lf = false;
            if rest[0] == b'\n' {
                rest = &rest[1..];
            }
        }

        while let Some(pos) = rest.iter().position(|b| *b == b'\n' || *b == b'\r') {
            self.line.extend_from_slice(&rest[..pos]);
            let terminator = rest[pos];
            rest = &rest[pos + 1..];
            if terminator == b'\r' {
                match rest.first() {
                    Some(b'\n') => rest = &rest[1..],
                    Some(_) => {}
                    None => self.skip_lf = true,
                }
            }
            self.finish_line(&mut out);
        }
        self.line.extend_from_slice(rest);
        out
    }

    /// True while an unterminated line or an undispatched event is buffered.
    ///
    /// At end of input such data is discarded, never emitted.
    pub fn has_pending(&self) -> bool {
        !self.line.is_empty() || self.has_data
    }

    /// Number of complete lines consumed so far.
    pub fn lines_read(&self) -> u64 {
        self.line_no
    }

    fn finish_line(&mut self, out: &mut Vec<Result<StreamEvent, DecodeError>>) {
        self.line_no += 1;
        let mut raw = std::mem::take(&mut self.line);
        if self.line_no == 1 && raw.starts_with(BOM) {
            raw.drain(..BOM.len());
        }

        if raw.is_empty() {
            if let Some(event) = self.dispatch() {
                out.push(Ok(event));
            }
            return;
        }

        let line = match String::from_utf8(raw) {
            Ok(line) => line,
            Err(_) => {
                out.push(Err(DecodeError::InvalidUtf8 { line: self.line_no }));
                return;
            }
        };
        if line.starts_with(':') {
            return;
        }
        let Some((field, value)) = line.split_once(':') else {
            out.push(Err(DecodeError::MissingSeparator {
                line: self.line_no,
                content: line,
            }));
            return;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Some(hint) = Self::parse_retry(value) {
                    out.push(Ok(hint));
                }
            }
            _ => {}
        }
    }

    // Values that are not all ASCII digits are ignored, like unknown fields.
    fn parse_retry(value: &str) -> Option<StreamEvent> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        value.parse::<u64>().ok().map(StreamEvent::retry_hint)
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(StreamEvent {
            kind: StreamEventKind::Message,
            event,
            id: self.last_id.clone(),
            data: std::mem::take(&mut self.data),
        })
    }
}
