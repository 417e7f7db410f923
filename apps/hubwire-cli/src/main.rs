//! hubwire: command-line client for the automation hub.
//!
//! Connects once, runs one command, and disconnects on exit.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hubwire_hub_connection::HubClient;

use config::FileConfig;

#[derive(Parser)]
#[command(name = "hubwire")]
#[command(about = "Query and control an automation hub over its real-time API")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hubwire.toml")]
    config: PathBuf,

    /// WebSocket endpoint (overrides config file)
    #[arg(long, env = "HUBWIRE_URL")]
    url: Option<String>,

    /// Long-lived access token (overrides config file)
    #[arg(long, env = "HUBWIRE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log client lifecycle details
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the hub answers and report the round-trip time
    Validate,
    /// List entity states
    States {
        /// Only entities of this domain (e.g. `light`)
        #[arg(long)]
        domain: Option<String>,
    },
    /// Show one entity's state
    State { entity_id: String },
    /// Call a service
    Call {
        domain: String,
        service: String,
        /// Service data as a JSON object
        #[arg(long)]
        data: Option<String>,
    },
    /// Print events as they arrive
    Watch {
        #[arg(default_value = "state_changed")]
        event_type: String,
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "info,hubwire=debug,hubwire_hub_connection=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = FileConfig::load(&cli.config)?.into_connection_config(cli.url, cli.token, cli.debug)?;
    let client = HubClient::new(config);

    let result = match client.connect().await {
        Ok(()) => commands::run(&client, cli.command).await,
        Err(e) => Err(e.into()),
    };
    client.disconnect().await;
    result
}
