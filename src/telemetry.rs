//! Metrics registry, scrape endpoint, and optional push
//!
//! Telemetry is best-effort throughout: a port that fails to bind or a
//! push endpoint that rejects the exposition is logged and the daemon
//! keeps running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TelemetryConfiguration;

/// How often the exposition is pushed when an endpoint is configured
const PUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Owns the metrics registry and its export paths
pub struct Telemetry {
    registry: Arc<Registry>,
    config: TelemetryConfiguration,
}

impl Telemetry {
    pub fn new(config: TelemetryConfiguration) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Spawn the scrape server and push task; both stop when `ctx` fires
    pub fn serve(&self, ctx: &CancellationToken) {
        if self.config.prometheus_port != 0 {
            let registry = self.registry.clone();
            let port = self.config.prometheus_port;
            let token = ctx.clone();

            tokio::spawn(async move {
                if let Err(e) = serve_scrape(registry, port, token).await {
                    warn!(port, error = %e, "Metrics endpoint unavailable");
                }
            });
        }

        if let Some(endpoint) = self.config.push_endpoint.clone() {
            let registry = self.registry.clone();
            let token = ctx.clone();

            tokio::spawn(async move {
                push_loop(registry, endpoint, token).await;
            });
        }
    }
}

async fn serve_scrape(
    registry: Arc<Registry>,
    port: u16,
    ctx: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Serving metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await?;

    Ok(())
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    match encode(&registry) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn push_loop(registry: Arc<Registry>, endpoint: String, ctx: CancellationToken) {
    let client = reqwest::Client::new();
    let mut interval = tokio::time::interval(PUSH_INTERVAL);
    interval.tick().await; // skip the immediate tick

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!("Metrics push task stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        let body = match encode(&registry) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to encode metrics for push");
                continue;
            }
        };

        let result = client
            .post(&endpoint)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(endpoint = %endpoint, status = %response.status(), "Metrics push rejected");
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Metrics push failed");
            }
        }
    }
}

fn encode(registry: &Registry) -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
