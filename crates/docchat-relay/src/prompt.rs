use crate::chat::{ChatOptions, DocumentQuestion};
use crate::client::{ChatCompletionRequest, ChatMessage};

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Renders the user turn that carries the document text and the question.
pub fn user_prompt(question: &DocumentQuestion) -> String {
    format!(
        "Here is the text extracted from a document: \"{}\".\n\
         The user has asked: \"{}\".\n\n\
         Please provide a clear and concise answer to the user's question first.\n\
         After giving the main answer, provide additional context, suggestions, or remarks if necessary.",
        question.extracted_text, question.question
    )
}

/// Builds the streaming request for one question.
pub fn completion_request(options: &ChatOptions, question: &DocumentQuestion) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: options.model.clone(),
        messages: vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(user_prompt(question)),
        ],
        temperature: options.temperature,
        top_p: options.top_p,
        max_tokens: options.max_tokens,
        stream: true,
        n: 1,
    }
}
