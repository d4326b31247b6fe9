//! Prometheus endpoint for a running job.
//!
//! Serves the metrics recorded during a run over HTTP, plus a health
//! endpoint so a scheduler can tell a long copy is still alive.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::error::{BindSnafu, MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Exposes:
/// - `/metrics` - Prometheus metrics in text format
/// - `/health` - returns 200 OK
///
/// The listener is bound before returning so an occupied port fails the
/// job at startup. Returns the bound address.
pub async fn init(addr: SocketAddr) -> Result<SocketAddr, MetricsError> {
    let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
    let local_addr = listener.local_addr().context(BindSnafu { addr })?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(serve(listener, handle));
    debug!(%local_addr, "Metrics endpoint listening");

    Ok(local_addr)
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
}

async fn serve(listener: TcpListener, handle: PrometheusHandle) {
    if let Err(e) = axum::serve(listener, router(handle)).await {
        error!(error = %e, "Metrics server stopped");
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_handler() {
        assert_eq!(health_handler().await, "ok\n");
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _router = router(handle.clone());
        let body = metrics_handler(Extension(handle)).await;
        assert!(!body.contains("sluice_rows_read_total"));
    }
}
