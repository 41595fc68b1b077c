use clap::Parser as _;
use docchat_relay::ChatHistory;
use docchat_server::config::{self, Cli, Command};
use docchat_server::{AppState, ask, observability, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    config::init();
    observability::init_observability();

    match Cli::parse().command {
        Command::Serve(args) => {
            let orchestrator = args.upstream.orchestrator()?;
            server::serve(&args.listen, AppState::new(orchestrator, ChatHistory::new())).await?;
        }
        Command::Ask(args) => ask::run(args).await?,
    }
    Ok(())
}
