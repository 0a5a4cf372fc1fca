//! Admin HTTP surface: `/healthz` and `/metrics`.
//!
//! Grounded on the teacher's `rest_api::server::run_server`, trimmed
//! down to the insecure branch — this crate's Cargo.toml doesn't carry
//! `axum_server`/`rustls`, and nothing in the spec calls for mTLS on
//! an admin port, so only the plain `axum::serve` path is kept.

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{DispatchError, Result};

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::metrics::REGISTRY).expect("metrics encoding is infallible");
    buffer
}

fn router() -> Router {
    let router = Router::new().route("/healthz", get(healthz));
    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));
    router.layer(TraceLayer::new_for_http())
}

/// Serve the admin surface on `addr` until the process is killed.
pub async fn run_server(addr: SocketAddr) -> Result<()> {
    info!(%addr, "admin REST API listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DispatchError::Invariant(format!("failed to bind admin server to {addr}: {e}")))?;
    axum::serve(listener, router())
        .await
        .map_err(|e| DispatchError::Invariant(format!("admin server error: {e}")))?;
    Ok(())
}
