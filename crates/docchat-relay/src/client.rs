use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt as _;
use tracing::debug;

use crate::errors::{ConnectionError, TransportError};

/// Raw upstream body chunks, exactly as the transport delivers them.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<Bytes, TransportError>> + Send + 'static>>;

/// Message author in a completion request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Body of a streaming chat-completion request.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub n: u32,
}

/// Anything that can open an upstream completion stream.
///
/// `CompletionClient` is the HTTP implementation; tests substitute canned
/// byte streams.
#[async_trait::async_trait]
pub trait CompletionSource: Send + Sync {
    /// Sends the request and returns the response body once a success status
    /// has been received. Nothing is read from the body yet.
    async fn open_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ByteStream, ConnectionError>;
}

/// Configuration for [`CompletionClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// API key used for bearer auth.
    pub api_key: String,
    /// Base URL of the OpenAI-compatible endpoint (proxies, local test servers).
    pub base_url: String,
    /// Time allowed to establish the TCP/TLS connection.
    pub connect_timeout: Duration,
    /// Optional deadline for the whole exchange, body included. Unset by
    /// default so slow generations are never truncated.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Creates a config with default endpoint and timeouts.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
        }
    }

    /// Overrides the API base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Imposes an overall deadline on each request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub(crate) fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// HTTP client for the streaming chat-completions endpoint.
pub struct CompletionClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl CompletionClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConnectionError> {
        if config.api_key.trim().is_empty() {
            return Err(ConnectionError::Config("api_key must not be empty".into()));
        }
        if config.base_url.trim().is_empty() {
            return Err(ConnectionError::Config("base_url must not be empty".into()));
        }
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| ConnectionError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl CompletionSource for CompletionClient {
    async fn open_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ByteStream, ConnectionError> {
        let url = self.config.completions_url();
        debug!(url = %url, model = %request.model, "opening completion stream");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| ConnectionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ConnectionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::new(format!("upstream read failed: {e}"))));
        Ok(Box::pin(stream))
    }
}
