//! # Beacon Server
//!
//! Nostr relay backed by a batched search index.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with a specific config file
//! beacon --config /path/to/beacon.toml
//!
//! # Override settings through the environment
//! BEACON__PORT=8080 BEACON__INDEX__BACKEND=memory beacon
//! ```

mod config;
mod handlers;
mod metrics;
mod relay;

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (None, _) => config::Config::load()?,
        (Some("--config"), Some(path)) => config::Config::from_file(path)?,
        (Some(other), _) => bail!("Unexpected argument: {other} (usage: beacon [--config <path>])"),
    };

    tracing::info!("Starting Beacon relay on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
