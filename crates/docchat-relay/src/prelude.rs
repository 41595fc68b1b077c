//! Common imports for typical relay usage.
pub use crate::{
    AbortHandle, ChatError, ChatOptions, ChatOrchestrator, ChatStream, ClientConfig,
    CompletionClient, CompletionSource, DocumentQuestion, SessionFailure, SessionOutcome,
    SessionState,
};
