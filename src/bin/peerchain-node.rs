#![forbid(unsafe_code)]
//! Runs a peerchain node and its REST API.

use clap::Parser;
use peerchain::api;
use peerchain::config::load_config;
use peerchain::logging::{init_logging, LogFormat};
use peerchain::Node;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file. Missing files fall back to defaults.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Address the API binds to, e.g. 0.0.0.0:8080
    #[arg(long)]
    listen: Option<String>,

    /// Url peers reach this node at
    #[arg(long)]
    self_url: Option<String>,

    /// Bootstrap peer url; repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Database path, or ":memory:"
    #[arg(long)]
    db: Option<String>,

    #[arg(long)]
    log_format: Option<LogFormat>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.network.listen_addr = listen;
    }
    if let Some(self_url) = cli.self_url {
        config.node.self_url = self_url;
    }
    config.network.bootstrap_peers.extend(cli.peers);
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_logging(config.logging.format, &config.logging.level);

    let listen_addr = config.network.listen_addr.clone();
    let node = Node::open(config)?;
    node.start().await?;

    api::serve(node, &listen_addr).await?;
    Ok(())
}
