//! # Focus Server
//!
//! Realtime hub for focus sessions: authenticated WebSocket connections,
//! event fan-out and credential refresh.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! focus
//!
//! # Run with a config file in the working directory
//! cp focus.example.toml focus.toml && focus
//!
//! # Run with environment variables
//! FOCUS_PORT=8080 FOCUS_HOST=0.0.0.0 FOCUS_AUTH__JWT_SECRET=... focus
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "focus=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting focus server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
