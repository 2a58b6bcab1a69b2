//! Metrics and health-probe HTTP endpoints
//!
//! Two small axum servers: `/metrics` on the metrics bind address and
//! `/healthz` + `/readyz` on the health-probe bind address. Both report
//! ok for as long as the process is serving. Listeners are bound by the
//! caller so a bad bind address fails startup instead of being lost in a
//! background task.

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::metrics::REGISTRY;
use crate::error::{Error, Result};

/// Prometheus text exposition of the allocator registry
async fn metrics_handler() -> String {
    let mut buffer = String::new();
    // Encoding into a String cannot fail; an empty page beats a panic.
    let _ = prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY);
    buffer
}

async fn ok_handler() -> &'static str {
    "ok"
}

/// Bind a listener for one of the observability endpoints.
pub async fn bind(addr: SocketAddr, what: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("{what} bind {addr}: {e}")))?;
    info!(%addr, "{what} endpoint listening");
    Ok(listener)
}

/// Serve `/metrics` on the bound listener until shutdown.
pub async fn serve_metrics(listener: TcpListener) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http());

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::config(format!("metrics server error: {e}")))
}

/// Serve `/healthz` and `/readyz` on the bound listener until shutdown.
pub async fn serve_probes(listener: TcpListener) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(ok_handler))
        .route("/readyz", get(ok_handler));

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::config(format!("health probe server error: {e}")))
}
