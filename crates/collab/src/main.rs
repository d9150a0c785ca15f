// docket-collabd: presence playground on an in-memory store.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use docket_collab::config::CollabConfig;
use docket_collab::playground::{Playground, PlaygroundOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docket-collabd", about = "Simulate collaborators on a shared document")]
struct Cli {
    /// Document to join
    #[arg(long, default_value = "demo-doc")]
    document: String,

    /// Local user id
    #[arg(long, default_value = "local-user")]
    user: String,

    /// Display name for the local user
    #[arg(long)]
    name: Option<String>,

    /// Email for the local user
    #[arg(long)]
    email: Option<String>,

    /// Number of simulated peers
    #[arg(long, default_value_t = 2)]
    peers: usize,

    /// Config file (defaults to ~/.docket/collab.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CollabConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => CollabConfig::load(),
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = PlaygroundOptions {
        document_id: cli.document,
        user_id: cli.user,
        user_name: cli.name,
        user_email: cli.email,
        peers: cli.peers,
    };
    info!(document_id = %options.document_id, peers = options.peers, "starting playground");
    let playground =
        Playground::start(options, config).await.context("failed to start playground")?;

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    playground.shutdown().await;
    Ok(())
}
