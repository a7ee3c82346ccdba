// ABOUTME: Entry point for voicegate — voice and keyword privilege control for a local assistant.
// ABOUTME: Parses CLI args, sets up logging, and dispatches the chosen command.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use voicegate::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run(cli).await
}
