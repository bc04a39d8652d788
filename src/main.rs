use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

mod archive;
mod config;
mod dispatcher;
mod errors;
mod file_manager;
mod policy;
mod protocol;
mod rcon;
mod runtime_manager;
mod sandbox;
mod signer;
mod stats;
mod transfer;
mod websocket_handler;

pub use config::AgentConfig;
pub use errors::{AgentError, AgentResult};
pub use runtime_manager::{ContainerDriver, DockerCli};
pub use websocket_handler::WebSocketHandler;

/// Minebot host agent
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load config first so logging level/format can be applied.
    let config = AgentConfig::from_file(&args.config)
        .map_err(AgentError::ConfigError)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let filter = format!("minebot_agent={},tokio=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Minebot agent starting");
    info!("Configuration loaded: {:?}", config);

    let config = Arc::new(config);
    let driver: Arc<dyn ContainerDriver> = Arc::new(DockerCli::new(config.docker_bin.clone()));
    let handler = WebSocketHandler::new(config.clone(), driver);

    handler
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.ws_url))?;

    let stopper = handler.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => stopper.shutdown(),
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    handler.run().await?;

    info!("Minebot agent stopped");
    Ok(())
}
