mod api;
mod config;
mod error;
mod models;
mod preview;
mod routes;
mod workflow;

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{api::ApiClient, config::Config, preview::PreviewStore, routes::AppState};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    tracing::info!(
        "Using generation service at {} (timeout {}s)",
        config.api_base,
        config.request_timeout.as_secs()
    );

    let state = AppState {
        sessions: Arc::default(),
        transport: Arc::new(ApiClient::new(config.api_base.clone())),
        previews: PreviewStore::default(),
        request_timeout: config.request_timeout,
        session_ttl: config.session_ttl,
    };
    routes::spawn_session_sweeper(state.clone(), SWEEP_INTERVAL);
    let app = routes::router(state, config.max_upload_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down");
}
