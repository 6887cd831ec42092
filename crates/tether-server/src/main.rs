//! # Tether
//!
//! Bidirectional relay between TCP and WebSocket endpoints.
//!
//! ## Usage
//!
//! ```bash
//! # Run with configuration from the default paths
//! tether
//!
//! # Run with a specific config file
//! tether /path/to/tether.toml
//!
//! # Override settings with environment variables
//! TETHER__STATUS__PORT=8082 TETHER__RETRY__TRIES=5 tether
//! ```

mod bridge;
mod config;
mod metrics;
mod status;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };
    config.validate()?;

    tracing::info!(
        upstreams = config.upstreams.len(),
        "Starting Tether v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
    }

    bridge::run(config).await
}
