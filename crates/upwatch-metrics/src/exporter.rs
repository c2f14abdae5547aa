//! ---
//! upw_section: "03-persistence-logging"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Prometheus scrape endpoint served over HTTP."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::SharedRegistry;

/// Bind `addr` and serve the registry at `/metrics` until
/// [`MetricsServer::shutdown`]. Port `0` picks a free port.
pub async fn serve_metrics(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    let bound = listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let app = Router::new()
        .route("/metrics", get(scrape))
        .with_state(registry);

    info!(address = %bound, "metrics exporter listening");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
            .context("metrics exporter failed")
    });

    Ok(MetricsServer {
        addr: bound,
        stop: Some(stop_tx),
        task,
    })
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut body) {
        error!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_owned())], body).into_response()
}

/// Running exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}
