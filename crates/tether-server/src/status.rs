//! HTTP status endpoint.

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::{CancellationToken, Transmitter, TransmitterState};
use tokio::net::TcpListener;
use tracing::info;

/// Build the status router.
pub fn router(transmitter: Arc<Transmitter>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(transmitter)
}

/// Serve the status router until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(
    addr: SocketAddr,
    transmitter: Arc<Transmitter>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status endpoint on {addr}"))?;

    info!("Status endpoint listening on {}", addr);

    axum::serve(listener, router(transmitter))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Status endpoint failed")
}

/// Health check handler.
async fn health_handler(State(transmitter): State<Arc<Transmitter>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sources": transmitter.source_count(),
        "state": state_name(transmitter.state()),
    }))
}

fn state_name(state: TransmitterState) -> &'static str {
    match state {
        TransmitterState::Idle => "idle",
        TransmitterState::Running => "running",
        TransmitterState::Draining => "draining",
        TransmitterState::Stopped => "stopped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_idle_bridge() {
        let transmitter = Arc::new(Transmitter::new());
        let Json(body) = health_handler(State(transmitter)).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["sources"], 0);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
