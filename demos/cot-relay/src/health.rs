//! Health check endpoint.
//!
//! Serves the relay counters as JSON.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tracing::info;

use crate::relay::RelayStats;

/// Health status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    /// Whether the relay is healthy.
    pub healthy: bool,
    /// Relay callsign.
    pub callsign: String,
    /// CoT messages received.
    pub received: u64,
    /// CoT messages relayed to the server.
    pub relayed: u64,
    /// Known contacts.
    pub contacts: usize,
    /// Interfaces currently up.
    pub interfaces_up: usize,
    /// Server endpoint, if relaying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

/// Shared state for the health endpoint.
#[derive(Clone)]
pub struct HealthState {
    callsign: String,
    server: Option<String>,
    stats: Arc<RelayStats>,
}

impl HealthState {
    /// Health state over `stats`.
    pub fn new(callsign: &str, server: Option<String>, stats: Arc<RelayStats>) -> Self {
        Self {
            callsign: callsign.to_string(),
            server,
            stats,
        }
    }

    /// Current status.
    pub fn status(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            callsign: self.callsign.clone(),
            received: self.stats.received(),
            relayed: self.stats.relayed(),
            contacts: self.stats.contacts(),
            interfaces_up: self.stats.interfaces_up(),
            server: self.server.clone(),
        }
    }
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.status()))
}

/// Liveness handler (always returns OK if the relay is running).
async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Router serving `/health` and `/live`.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/live", get(live_handler))
        .with_state(state)
}

/// Start the health check server.
pub async fn start_health_server(
    bind_addr: SocketAddr,
    state: HealthState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "health server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_reflects_counters() {
        let stats = Arc::new(RelayStats::default());
        stats.mark_relayed();
        let state = HealthState::new("RELAY", Some("tak:8087:tcp".to_string()), stats);
        let status = state.status();
        assert!(status.healthy);
        assert_eq!(status.callsign, "RELAY");
        assert_eq!(status.relayed, 1);
        assert_eq!(status.received, 0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["server"], "tak:8087:tcp");
    }

    #[tokio::test]
    async fn test_server_field_omitted_without_server() {
        let state = HealthState::new("RELAY", None, Arc::new(RelayStats::default()));
        let json = serde_json::to_value(state.status()).unwrap();
        assert!(json.get("server").is_none());
    }
}
