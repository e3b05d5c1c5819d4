//! Ingests one or more `(subject, kind, granularity)` feed scopes: backfill,
//! then push-mode listen, plus a retention pruning loop per scope.

use std::sync::Arc;

use anyhow::Result;
use coordinator_core::config::Config;
use coordinator_core::ingest::{scope_for, FeedIngestor};
use coordinator_core::model::FeedKind;
use coordinator_core::notify::Notifier;
use coordinator_core::providers::create_provider;
use coordinator_core::store::FeedStore;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    info!(?config.feed_subjects, provider = %config.feed_provider, "market_data_worker starting");

    let store = Arc::new(FeedStore::open(&config.database_path)?);
    let notifier = Notifier::new();
    let kind = FeedKind::parse(&config.feed_kind);
    let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    let mut handles = Vec::new();
    for subject in &config.feed_subjects {
        let provider = create_provider(&config.feed_provider, subject, &config.feed_granularity);
        let scope = scope_for(&config.feed_source, subject, kind, &config.feed_granularity);
        let ingestor = Arc::new(FeedIngestor::new(
            scope,
            provider,
            store.clone(),
            notifier.clone(),
            config.feed_backfill_minutes,
            config.feed_poll_seconds,
        ));

        let run_ingestor = ingestor.clone();
        let run_cancel = cancel_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_ingestor.run(run_cancel).await {
                tracing::warn!(error = %e, "ingestor stopped");
            }
        }));

        let retention_ingestor = ingestor.clone();
        let ttl_days = config.feed_record_ttl_days;
        handles.push(tokio::spawn(async move {
            retention_ingestor.run_retention_loop(ttl_days, 3600).await;
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
