//! Round-robin prediction scheduler + model dispatcher loop: on each group's
//! cadence, fans a scope out to every registered model and persists the
//! resulting `PredictionRecord`s.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use coordinator_core::config::Config;
use coordinator_core::contract::CrunchContract;
use coordinator_core::dispatch::{HttpModelRunnerClient, ModelDispatcher, ModelRunnerClient};
use coordinator_core::model::{FeedKind, PredictionParams, ScheduledPredictionConfig};
use coordinator_core::scheduler::{create_group_schedulers, GroupScheduler};
use coordinator_core::store::{FeedStore, RunsStore};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    info!(subjects = ?config.feed_subjects, "predict_worker starting");

    let feed_store = Arc::new(FeedStore::open(&config.database_path)?);
    let runs_store = Arc::new(RunsStore::open(&config.database_path)?);

    let mut contract = CrunchContract::default();
    contract.crunch_pubkey = config.crunch_id.clone();

    seed_default_configs(&runs_store, &contract, &config)?;

    let runner: Arc<dyn ModelRunnerClient> = Arc::new(HttpModelRunnerClient::new(
        &config.model_runner_host,
        config.model_runner_port,
        Duration::from_secs(config.model_runner_timeout_seconds),
    ));

    let dispatcher = ModelDispatcher::with_provider(
        contract,
        feed_store.clone(),
        runs_store.clone(),
        runner,
        config.feed_candles_window,
        Duration::from_secs(config.model_runner_timeout_seconds),
        config.feed_source.clone(),
        config.feed_granularity.clone(),
        config.feed_provider.clone(),
    );

    let active_configs = runs_store.fetch_active_configs()?;
    let mut schedulers = create_group_schedulers(&active_configs);
    seed_recovery_state(&mut schedulers, &runs_store)?;

    let configs_by_group: std::collections::HashMap<_, _> = active_configs
        .iter()
        .map(|c| (GroupScheduler::group_key(c.prediction_params.horizon, &c.prediction_params.steps, c.every_seconds as f64), c.scope_template.clone()))
        .collect();

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let now = Utc::now();

        for scheduler in &mut schedulers {
            let asset = scheduler.peek_asset().to_string();
            let latest_info_dt = feed_store
                .fetch_latest_record(&config.feed_source, &asset, FeedKind::Candle, &config.feed_granularity)
                .ok()
                .flatten()
                .map(|r| r.ts_event);

            let Some(params) = scheduler.next(now, latest_info_dt) else {
                continue;
            };

            let scope_template = configs_by_group.get(&scheduler.key()).cloned().unwrap_or_default();

            match dispatcher.dispatch(&params, &scope_template).await {
                Ok(true) => scheduler.mark_executed(&params.asset, now),
                Ok(false) => {}
                Err(e) => warn!(asset = %params.asset, error = %e, "dispatch cycle failed"),
            }
        }
    }
}

/// First boot: no `ScheduledPredictionConfig` rows exist yet, so seed one per
/// configured feed subject from the contract's scope defaults.
fn seed_default_configs(runs_store: &RunsStore, contract: &CrunchContract, config: &Config) -> Result<()> {
    if !runs_store.fetch_active_configs()?.is_empty() {
        return Ok(());
    }

    for (order, subject) in config.feed_subjects.iter().enumerate() {
        let params = PredictionParams::new(
            subject.clone(),
            contract.scope_defaults.horizon_seconds,
            vec![contract.scope_defaults.step_seconds],
        );
        let cfg = ScheduledPredictionConfig {
            id: format!("cfg-{subject}"),
            scope_key: format!("{subject}:{}:{}", contract.scope_defaults.horizon_seconds, contract.scope_defaults.step_seconds),
            scope_template: Default::default(),
            prediction_params: params,
            every_seconds: config.predict_every_seconds,
            active: true,
            order: order as i64,
        };
        runs_store.upsert_config(&cfg)?;
    }
    Ok(())
}

/// Recovery: seed each group's LRU state from the newest `performed_at` per scope.
fn seed_recovery_state(schedulers: &mut [GroupScheduler], runs_store: &RunsStore) -> Result<()> {
    let by_scope = runs_store.latest_performed_at_by_scope()?;
    for scheduler in schedulers.iter_mut() {
        let executions: Vec<_> = by_scope
            .iter()
            .filter_map(|(scope_key, ts)| {
                let mut parts = scope_key.splitn(3, ':');
                let asset = parts.next()?;
                let horizon: i64 = parts.next()?.parse().ok()?;
                let step: i64 = parts.next()?.parse().ok()?;
                Some((PredictionParams::new(asset, horizon, vec![step]), *ts))
            })
            .collect();
        scheduler.set_last_executions(&executions);
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
