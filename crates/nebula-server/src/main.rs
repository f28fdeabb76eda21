//! # Nebula Server
//!
//! Realtime gateway with shared presence.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! nebula
//!
//! # Point several instances at one Redis
//! NEBULA_REDIS_URL=redis://127.0.0.1:6379 NEBULA_PORT=4002 nebula
//!
//! # Run with environment variables
//! NEBULA_PORT=8080 NEBULA_HOST=0.0.0.0 nebula
//! ```

use anyhow::Result;
use nebula_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nebula=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Nebula server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
