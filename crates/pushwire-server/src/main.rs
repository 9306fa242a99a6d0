//! # pushwire
//!
//! Topic push server for Comet, Direct and WebSocket clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! pushwire
//!
//! # Run with environment variables
//! PUSHWIRE_PORT=8080 PUSHWIRE_HOST=0.0.0.0 pushwire
//! ```
//!
//! A `pushwire.toml` in the working directory, `/etc/pushwire/` or
//! `~/.config/pushwire/` overrides the defaults.

mod config;
mod handlers;
mod metrics;
mod sockets;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pushwire=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting pushwire on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
