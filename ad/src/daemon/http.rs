//! Health endpoint
//!
//! `GET /health` returns the full health object; `GET /ready` answers 200
//! while the daemon runs and 503 otherwise, for supervisor probes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::DaemonShared;

async fn health(State(shared): State<Arc<DaemonShared>>) -> Json<serde_json::Value> {
    let report = shared.health().await;
    Json(serde_json::to_value(report).unwrap_or_default())
}

async fn ready(State(shared): State<Arc<DaemonShared>>) -> StatusCode {
    if shared.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serve `/health` and `/ready` on the configured port
pub fn spawn_health_server(shared: Arc<DaemonShared>, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .with_state(shared);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(%addr, "Health endpoint listening");
                if let Err(e) = axum::serve(listener, app).await {
                    warn!(error = %e, "Health server exited");
                }
            }
            Err(e) => {
                warn!(%addr, error = %e, "Failed to bind health endpoint");
            }
        }
    })
}
