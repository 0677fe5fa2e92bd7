//! Admin HTTP endpoint: health and Prometheus metrics
//!
//! Only compiled with the `metrics` feature; without it the spawn helper
//! is a no-op so callers need no feature gates.

#[cfg(feature = "metrics")]
use axum::{routing::get, Router};
use tracing::info;

use crate::config::AdminSection;
use crate::error::Result;

/// Start the admin endpoint when enabled. Returns immediately; the server
/// runs on its own task for the lifetime of the process.
#[cfg(feature = "metrics")]
pub async fn spawn(config: &AdminSection) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let handle = crate::metrics::init_metrics();
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "admin endpoint started");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "admin endpoint failed");
        }
    });
    Ok(())
}

#[cfg(not(feature = "metrics"))]
pub async fn spawn(config: &AdminSection) -> Result<()> {
    if config.enabled {
        info!("admin endpoint requested but the metrics feature is disabled");
    }
    Ok(())
}
