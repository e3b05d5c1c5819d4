//! Settlement loop: resolve ground truth for due inputs, score the resulting
//! predictions, refresh windowed aggregates, then rebuild the leaderboard and
//! emission checkpoint on the configured cadence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coordinator_core::config::Config;
use coordinator_core::contract::CrunchContract;
use coordinator_core::leaderboard::LeaderboardBuilder;
use coordinator_core::resolve::GroundTruthResolver;
use coordinator_core::score::ScoringEngine;
use coordinator_core::store::{FeedStore, ModelStore, RunsStore};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    info!("score_worker starting");

    let feed_store = Arc::new(FeedStore::open(&config.database_path)?);
    let runs_store = Arc::new(RunsStore::open(&config.database_path)?);
    let model_store = Arc::new(ModelStore::open(&config.database_path)?);

    let mut contract = CrunchContract::default();
    contract.crunch_pubkey = config.crunch_id.clone();

    let resolver = GroundTruthResolver::new(
        contract.clone(),
        feed_store,
        runs_store.clone(),
        config.feed_source.clone(),
        config.feed_granularity.clone(),
        config.resolver_max_retry_hours,
    );
    let scoring = ScoringEngine::new(
        contract.clone(),
        runs_store.clone(),
        model_store.clone(),
        config.feed_record_ttl_days,
        config.feed_record_ttl_days,
    );
    let leaderboard = LeaderboardBuilder::new(contract, model_store);

    let mut settle_ticker = tokio::time::interval(Duration::from_secs(10));
    let mut checkpoint_ticker = tokio::time::interval(Duration::from_secs(config.checkpoint_interval_seconds));

    loop {
        tokio::select! {
            _ = settle_ticker.tick() => {
                if let Err(e) = resolver.run_cycle() {
                    warn!(error = %e, "resolver cycle failed");
                }
                if let Err(e) = scoring.run_cycle() {
                    warn!(error = %e, "scoring cycle failed");
                }
            }
            _ = checkpoint_ticker.tick() => {
                match leaderboard.build_leaderboard() {
                    Ok(board) => {
                        if let Err(e) = leaderboard.build_emission(&board) {
                            warn!(error = %e, "emission build failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "leaderboard build failed"),
                }
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
