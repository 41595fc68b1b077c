use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use docchat_relay::{ChatError, ChatOptions, ChatOrchestrator, ClientConfig, CompletionClient};

/// Loads `.env` from the crate directory, then from the working directory.
pub fn init() {
    let _ = dotenvy::from_path(Path::new(
        format!("{}/.env", env!("CARGO_MANIFEST_DIR")).as_str(),
    ));
    dotenvy::dotenv().ok();
}

/// Top-level command line.
#[derive(Debug, clap::Parser)]
#[command(name = "docchat", version, about = "Ask questions about extracted document text")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the HTTP API.
    Serve(ServeArgs),
    /// Ask one question from the terminal and stream the answer to stdout.
    Ask(AskArgs),
}

#[derive(Debug, clap::Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub upstream: UpstreamArgs,
    /// Address the HTTP server binds to.
    #[arg(long, env = "DOCCHAT_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: String,
}

#[derive(Debug, clap::Args)]
pub struct AskArgs {
    #[command(flatten)]
    pub upstream: UpstreamArgs,
    /// Text file holding extracted document text. Repeat to ask across several.
    #[arg(long = "document", required = true)]
    pub documents: Vec<PathBuf>,
    #[arg(long)]
    pub question: String,
    /// Wait for the full answer and print it with an "Additional Context" section.
    #[arg(long)]
    pub remarks: bool,
}

/// Settings for the upstream completion API.
#[derive(Debug, Clone, clap::Args)]
pub struct UpstreamArgs {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,
    #[arg(long, env = "DOCCHAT_BASE_URL", default_value = "https://api.openai.com")]
    pub base_url: String,
    #[arg(long, env = "DOCCHAT_MODEL", default_value = "gpt-4")]
    pub model: String,
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long)]
    pub top_p: Option<f32>,
    #[arg(long)]
    pub max_tokens: Option<u32>,
    /// Fragments buffered per answer before the upstream read pauses.
    #[arg(long = "buffer", env = "DOCCHAT_RELAY_BUFFER", default_value_t = 32)]
    pub relay_buffer: usize,
    /// Overall deadline per upstream request. Unset means no deadline.
    #[arg(long, env = "DOCCHAT_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,
}

impl UpstreamArgs {
    pub fn client_config(&self) -> ClientConfig {
        let config = ClientConfig::new(self.api_key.clone()).base_url(self.base_url.clone());
        match self.request_timeout_secs {
            Some(secs) => config.request_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }

    pub fn chat_options(&self) -> ChatOptions {
        let mut options = ChatOptions::default()
            .model(self.model.clone())
            .relay_capacity(self.relay_buffer);
        options.temperature = self.temperature;
        options.top_p = self.top_p;
        options.max_tokens = self.max_tokens;
        options
    }

    pub fn orchestrator(&self) -> Result<ChatOrchestrator, ChatError> {
        let client = CompletionClient::new(self.client_config())?;
        ChatOrchestrator::new(Arc::new(client), self.chat_options())
    }
}
