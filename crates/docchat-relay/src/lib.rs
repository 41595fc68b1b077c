//! Streaming relay for document question answering.
//!
//! A question about extracted document text is sent to an OpenAI-compatible
//! chat-completions endpoint; the event-stream response is decoded, each
//! content delta is extracted, and fragments are relayed to the caller through
//! a bounded channel in arrival order.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docchat_relay::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ChatError> {
//! let client = CompletionClient::new(ClientConfig::new("sk-..."))?;
//! let chat = ChatOrchestrator::new(Arc::new(client), ChatOptions::default())?;
//!
//! let mut answer = chat
//!     .ask(DocumentQuestion::new("Invoice total: 42 EUR", "What is the total?"))
//!     .await?;
//! while let Some(fragment) = answer.next_fragment().await {
//!     print!("{}", String::from_utf8_lossy(&fragment?));
//! }
//! # Ok(())
//! # }
//! ```

/// Splitting a finished answer into main text and remarks.
pub mod answer;
/// Chat orchestrator, question and option types.
pub mod chat;
/// Upstream completion client and request types.
pub mod client;
/// Incremental event-stream decoder.
pub mod decoder;
/// Public error types.
pub mod errors;
/// Content-delta extraction from decoded events.
pub mod extractor;
/// In-memory chat history with live subscriptions.
pub mod history;
/// Common imports for typical usage.
pub mod prelude;
/// Prompt construction.
pub mod prompt;
/// Back-pressured fragment channel between a session and its consumer.
pub mod relay;
/// Session state machine and the decode/extract/emit loop.
pub mod session;

pub use answer::{FormattedAnswer, split_answer};
pub use chat::{
    ALL_FILES_KEY, ChatOptions, ChatOrchestrator, ChatStream, DocumentQuestion, PendingOutcome,
};
pub use client::{
    ByteStream, ChatCompletionRequest, ChatMessage, ClientConfig, CompletionClient,
    CompletionSource, Role,
};
pub use decoder::{EventStreamDecoder, StreamEvent, StreamEventKind};
pub use errors::{
    ChatError, ConnectionError, DecodeError, ExtractionError, RelayError, SessionFailure,
    TransitionError, TransportError,
};
pub use extractor::{ChatDelta, DONE_SENTINEL, Extraction, extract};
pub use history::{ChatEntry, ChatHistory, HistorySubscription, Sender};
pub use relay::{FragmentSink, RelaySender, RelayStream};
pub use session::{
    AbortHandle, AbortSignal, SessionOutcome, SessionState, StreamSession, abort_pair,
};
