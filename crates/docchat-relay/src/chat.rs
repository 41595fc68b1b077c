use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::client::CompletionSource;
use crate::errors::{ChatError, SessionFailure};
use crate::prompt;
use crate::relay::{self, RelayStream};
use crate::session::{AbortHandle, SessionOutcome, StreamSession, abort_pair};

/// History key used when a question spans every uploaded document.
pub const ALL_FILES_KEY: &str = "all-files";

/// A question about already-extracted document text.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DocumentQuestion {
    pub extracted_text: String,
    pub question: String,
}

impl DocumentQuestion {
    pub fn new(extracted_text: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            extracted_text: extracted_text.into(),
            question: question.into(),
        }
    }

    /// Asks one question across several documents; their text is joined with
    /// newlines in the given order.
    pub fn across<I, S>(documents: I, question: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extracted_text = documents
            .into_iter()
            .map(|doc| doc.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            extracted_text,
            question: question.into(),
        }
    }

    fn validate(&self) -> Result<(), ChatError> {
        if self.extracted_text.trim().is_empty() {
            return Err(ChatError::Validation(
                "extracted text must not be empty".into(),
            ));
        }
        if self.question.trim().is_empty() {
            return Err(ChatError::Validation("question must not be empty".into()));
        }
        Ok(())
    }
}

/// Model and relay settings shared by every question.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Fragments buffered between the session and a slow consumer.
    pub relay_capacity: usize,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            relay_capacity: 32,
        }
    }
}

impl ChatOptions {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn relay_capacity(mut self, capacity: usize) -> Self {
        self.relay_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<(), ChatError> {
        if self.model.trim().is_empty() {
            return Err(ChatError::Validation("model must not be empty".into()));
        }
        if self.relay_capacity == 0 {
            return Err(ChatError::Validation(
                "relay_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Issues upstream requests and wires each one to a relay.
pub struct ChatOrchestrator {
    source: Arc<dyn CompletionSource>,
    options: ChatOptions,
}

impl ChatOrchestrator {
    pub fn new(source: Arc<dyn CompletionSource>, options: ChatOptions) -> Result<Self, ChatError> {
        options.validate()?;
        Ok(Self { source, options })
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    /// Opens the upstream stream and starts relaying the answer.
    ///
    /// Connection failures (including non-success statuses) are returned here,
    /// before any fragment exists. Later failures arrive through the relay.
    pub async fn ask(&self, question: DocumentQuestion) -> Result<ChatStream, ChatError> {
        question.validate()?;
        let request = prompt::completion_request(&self.options, &question);
        let session = StreamSession::new();
        let session_id = session.id();

        let bytes = self.source.open_stream(&request).await.map_err(|err| {
            debug!(%session_id, error = %err, "upstream connection failed");
            ChatError::from(err)
        })?;

        let (mut sender, relay) = relay::channel(self.options.relay_capacity);
        let (abort, signal) = abort_pair();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = session.run(bytes, &mut sender, signal).await;
            let _ = outcome_tx.send(outcome);
        });

        Ok(ChatStream {
            session_id,
            relay,
            abort,
            outcome: PendingOutcome { rx: outcome_rx },
        })
    }
}

/// Resolves to the session's final report.
#[derive(Debug)]
pub struct PendingOutcome {
    rx: oneshot::Receiver<SessionOutcome>,
}

impl PendingOutcome {
    pub async fn wait(self) -> Result<SessionOutcome, ChatError> {
        self.rx
            .await
            .map_err(|_| ChatError::protocol_msg("session task ended without an outcome"))
    }
}

/// Handle to one in-flight answer.
///
/// Dropping the relay (or the whole handle) disconnects the consumer, which
/// makes the session drop its upstream connection.
#[derive(Debug)]
pub struct ChatStream {
    session_id: uuid::Uuid,
    relay: RelayStream,
    abort: AbortHandle,
    outcome: PendingOutcome,
}

impl ChatStream {
    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Waits for the next UTF-8 fragment. A final `Err` marks a failed session.
    pub async fn next_fragment(&mut self) -> Option<Result<Bytes, SessionFailure>> {
        self.relay.next_fragment().await
    }

    /// Splits the handle so the relay can be handed to a response body while
    /// the outcome is awaited elsewhere.
    pub fn into_parts(self) -> (RelayStream, AbortHandle, PendingOutcome) {
        (self.relay, self.abort, self.outcome)
    }

    /// Drains the relay and returns the full answer.
    pub async fn collect_answer(mut self) -> Result<String, ChatError> {
        while let Some(item) = self.relay.next_fragment().await {
            item?;
        }
        let outcome = self.outcome.wait().await?;
        Ok(outcome.into_result()?)
    }
}
