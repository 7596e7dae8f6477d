//! Rat room sync hub.
//!
//! Reads world-state updates (newline-delimited JSON) from stdin or a file
//! and fans them out to WebSocket clients:
//!
//!   indexer | CHAIN_ID=84532 PRIVATE_KEY=0x... ratroom-hub --listen 0.0.0.0:3131
//!
//! Clients connect to `ws://host:3131/ws-connect/<rat id>`.

use clap::Parser;
use ratroom_hub::{ChainConfig, Config, HubConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ratroom-hub", version, about = "Rat room world-state fan-out hub")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "RATROOM_LISTEN", default_value = ratroom_hub::config::DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Numeric id of the chain the world lives on.
    #[arg(long, env = "CHAIN_ID")]
    chain_id: String,

    /// Signing key for the world-state source.
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// TOML file with hub tuning.
    #[arg(long, env = "RATROOM_CONFIG")]
    config: Option<PathBuf>,

    /// Read world events from this file instead of stdin.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ratroom_hub=info".parse()?))
        .init();

    let args = Args::parse();

    let chain = ChainConfig::new(&args.chain_id, &args.private_key)?;
    let hub = match &args.config {
        Some(path) => HubConfig::from_file(path)?,
        None => HubConfig::default(),
    };

    let server = ratroom_hub::initialize(Config {
        listen: args.listen,
        chain,
        hub,
    })
    .await?;

    let adapter = server.adapter();
    let source = tokio::spawn(async move {
        match args.events {
            Some(path) => match tokio::fs::File::open(&path).await {
                Ok(file) => adapter.run_lines(BufReader::new(file)).await,
                Err(e) => Err(e),
            },
            None => adapter.run_lines(BufReader::new(tokio::io::stdin())).await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
        result = source => {
            match result {
                Ok(Ok(stats)) => {
                    tracing::info!("World-state source closed after {} events", stats.emitted)
                }
                Ok(Err(e)) => tracing::error!("World-state source failed: {}", e),
                Err(e) => tracing::error!("World-state task panicked: {}", e),
            }
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
        }
    }

    server.shutdown().await?;
    Ok(())
}
