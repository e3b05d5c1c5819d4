//! HTTP surface: serves the latest leaderboard, per-model state, and feed
//! tails for operator/UI consumption.

use std::sync::Arc;

use anyhow::{Context, Result};
use coordinator_core::config::Config;
use coordinator_core::report::{router, ReportState};
use coordinator_core::store::{FeedStore, ModelStore};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    let model_store = Arc::new(ModelStore::open(&config.database_path)?);
    let feed_store = Arc::new(FeedStore::open(&config.database_path)?);
    let state = ReportState { model_store, feed_store };

    let addr = format!("0.0.0.0:{}", config.report_port);
    let listener = TcpListener::bind(&addr).await.context("bind report_worker listener")?;
    info!(%addr, "report_worker listening");

    axum::serve(listener, router(state)).await.context("axum serve")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
