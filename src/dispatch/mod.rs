//! Model dispatcher: fan out `tick`/`predict` to the model runner for each
//! scheduler emission, classify responses, and persist one batch per cycle.

pub mod runner;

use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::contract::CrunchContract;
use crate::error::Result;
use crate::model::{
    FeedKind, InputRecord, Model, PredictionParams, PredictionRecord, PredictionScope, PredictionStatus,
};
use crate::providers::create_provider;
use crate::store::{FeedStore, RunsStore};

pub use runner::{HttpModelRunnerClient, ModelInfo, ModelRunnerClient, ModelTickResult};

pub type ModelId = String;

/// Single-writer registry of discovered models: updated on every `tick`
/// response so display-name/deployment changes propagate without restart.
pub struct ModelRegistry {
    inner: ArcSwap<HashMap<ModelId, Model>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self { inner: ArcSwap::from_pointee(HashMap::new()) }
    }

    pub fn snapshot(&self) -> Arc<HashMap<ModelId, Model>> {
        self.inner.load_full()
    }

    fn upsert(&self, model_id: &str, info: &ModelInfo) {
        let mut map = (*self.inner.load_full()).clone();
        let entry = map.entry(model_id.to_string()).or_insert_with(|| {
            Model::new(model_id, &info.model_name, &info.cruncher_id, &info.cruncher_name, &info.deployment_id)
        });
        entry.name = info.model_name.clone();
        entry.player_id = info.cruncher_id.clone();
        entry.player_name = info.cruncher_name.clone();
        entry.deployment_identifier = info.deployment_id.clone();
        entry.updated_at = Utc::now();
        self.inner.store(Arc::new(map));
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ModelDispatcher {
    contract: CrunchContract,
    feed_store: Arc<FeedStore>,
    runs_store: Arc<RunsStore>,
    registry: Arc<ModelRegistry>,
    runner: Arc<dyn ModelRunnerClient>,
    candles_window: usize,
    timeout: Duration,
    source: String,
    granularity: String,
    feed_provider: String,
}

impl ModelDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contract: CrunchContract,
        feed_store: Arc<FeedStore>,
        runs_store: Arc<RunsStore>,
        runner: Arc<dyn ModelRunnerClient>,
        candles_window: usize,
        timeout: Duration,
        source: impl Into<String>,
        granularity: impl Into<String>,
    ) -> Self {
        Self::with_provider(
            contract, feed_store, runs_store, runner, candles_window, timeout, source, granularity, "mock",
        )
    }

    /// `feed_provider` names the provider used for on-demand backfill when a
    /// scope's candle window is thinner than `candles_window`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_provider(
        contract: CrunchContract,
        feed_store: Arc<FeedStore>,
        runs_store: Arc<RunsStore>,
        runner: Arc<dyn ModelRunnerClient>,
        candles_window: usize,
        timeout: Duration,
        source: impl Into<String>,
        granularity: impl Into<String>,
        feed_provider: impl Into<String>,
    ) -> Self {
        Self {
            contract,
            feed_store,
            runs_store,
            registry: Arc::new(ModelRegistry::new()),
            runner,
            candles_window,
            timeout,
            source: source.into(),
            granularity: granularity.into(),
            feed_provider: feed_provider.into(),
        }
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        self.registry.clone()
    }

    /// Runs one dispatch cycle for a scheduler emission. Returns `true` if at
    /// least one prediction record was persisted (the caller should then call
    /// `scheduler.mark_executed`).
    pub async fn dispatch(&self, params: &PredictionParams, scope_template: &BTreeMap<String, Value>) -> Result<bool> {
        let scope = PredictionScope {
            subject: params.asset.clone(),
            horizon_seconds: params.horizon,
            step_seconds: *params.steps.first().unwrap_or(&0),
            extra: scope_template.clone(),
        };
        let scope_key = scope.scope_key();

        let now = Utc::now();
        let raw_input = self.build_raw_input(&params.asset, now).await?;

        let inference_input = match &self.contract.transform {
            Some(f) => f(raw_input.clone()),
            None => raw_input.clone(),
        };

        let input = InputRecord::new(raw_input, scope.clone(), now, params.horizon);
        self.runs_store.insert_input(&input)?;

        let models = self.runner.list_models().await?;
        if models.is_empty() {
            return Ok(false);
        }

        let tick_futures = models.iter().map(|model_id| {
            let runner = self.runner.clone();
            let input = inference_input.clone();
            let model_id = model_id.clone();
            async move {
                let result = runner.tick(&model_id, &input).await;
                (model_id, result)
            }
        });
        for (model_id, result) in join_all(tick_futures).await {
            if let Ok(info) = result {
                self.registry.upsert(&model_id, &info);
            }
        }

        let predict_futures = models.iter().map(|model_id| {
            let runner = self.runner.clone();
            let scope = scope.clone();
            let model_id = model_id.clone();
            let timeout = self.timeout;
            async move {
                let start = Instant::now();
                let outcome = tokio::time::timeout(timeout, runner.predict(&model_id, &scope)).await;
                (model_id, outcome, start.elapsed())
            }
        });

        let mut records = Vec::with_capacity(models.len());
        for (model_id, outcome, elapsed) in join_all(predict_futures).await {
            let record = self.classify(&model_id, &input.id, &scope_key, &scope, outcome, elapsed);
            records.push(record);
        }

        if records.is_empty() {
            return Ok(false);
        }

        self.runs_store.insert_predictions(&records)?;
        info!(asset = %params.asset, count = records.len(), "dispatch cycle persisted predictions");
        Ok(true)
    }

    fn classify(
        &self,
        model_id: &str,
        input_id: &str,
        scope_key: &str,
        scope: &PredictionScope,
        outcome: std::result::Result<std::result::Result<Value, crate::error::CoordinatorError>, tokio::time::error::Elapsed>,
        elapsed: Duration,
    ) -> PredictionRecord {
        let now = Utc::now();
        let (status, inference_output, failed_reason, exec_time_ms) = match outcome {
            Ok(Ok(output)) => match validate_inference_output(&output) {
                Ok(()) => (PredictionStatus::Pending, Some(output), None, elapsed.as_millis() as f64),
                Err(reason) => (PredictionStatus::Failed, None, Some(reason), elapsed.as_millis() as f64),
            },
            Ok(Err(crate::error::CoordinatorError::ModelAbsent)) => {
                (PredictionStatus::Absent, None, None, 0.0)
            }
            Ok(Err(e)) => (PredictionStatus::Failed, None, Some(e.to_string()), elapsed.as_millis() as f64),
            Err(_) => (PredictionStatus::Failed, None, Some("timeout".to_string()), elapsed.as_millis() as f64),
        };

        let id = PredictionRecord::generate_id(status, model_id, scope_key, now);
        PredictionRecord {
            id,
            input_id: input_id.to_string(),
            model_id: model_id.to_string(),
            prediction_config_id: None,
            scope_key: scope_key.to_string(),
            scope: scope.clone(),
            status,
            exec_time_ms,
            inference_output,
            failed_reason,
            performed_at: now,
            resolvable_at: now + chrono::Duration::seconds(scope.horizon_seconds),
        }
    }

    async fn build_raw_input(&self, subject: &str, now: chrono::DateTime<Utc>) -> Result<Value> {
        let from = now - chrono::Duration::minutes(self.candles_window as i64 * 2);
        let mut candles = self.feed_store.fetch_records(
            &self.source,
            subject,
            FeedKind::Candle,
            &self.granularity,
            from.timestamp_millis(),
            now.timestamp_millis(),
        )?;

        if candles.len() < self.candles_window {
            warn!(subject, have = candles.len(), want = self.candles_window, "insufficient candles, backfilling on demand");
            let provider = create_provider(&self.feed_provider, subject, &self.granularity);
            match provider.fetch(from, now).await {
                Ok(fetched) if !fetched.is_empty() => {
                    self.feed_store.append_records(&fetched)?;
                    candles = self.feed_store.fetch_records(
                        &self.source,
                        subject,
                        FeedKind::Candle,
                        &self.granularity,
                        from.timestamp_millis(),
                        now.timestamp_millis(),
                    )?;
                }
                Ok(_) => {}
                Err(e) => warn!(subject, error = %e, "on-demand backfill failed"),
            }
        }

        let candles_json: Vec<Value> = candles
            .iter()
            .rev()
            .take(self.candles_window)
            .map(|c| serde_json::json!({"ts_event": c.ts_event.timestamp(), "values": c.values}))
            .collect();

        Ok(serde_json::json!({
            "symbol": subject,
            "asof_ts": now.timestamp(),
            "candles_1m": candles_json,
        }))
    }
}

fn validate_inference_output(output: &Value) -> std::result::Result<(), String> {
    if !output.is_object() {
        return Err("inference output is not an object".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner::MockRunner;

    #[tokio::test]
    async fn dispatch_persists_pending_predictions_on_success() {
        let feed_store = Arc::new(FeedStore::open_in_memory().unwrap());
        let runs_store = Arc::new(RunsStore::open_in_memory().unwrap());
        let runner: Arc<dyn ModelRunnerClient> = Arc::new(MockRunner::always_succeeds());
        let dispatcher = ModelDispatcher::new(
            CrunchContract::default(),
            feed_store,
            runs_store.clone(),
            runner,
            5,
            Duration::from_secs(1),
            "mock",
            "1m",
        );

        let params = PredictionParams::new("BTC", 60, vec![15]);
        let dispatched = dispatcher.dispatch(&params, &BTreeMap::new()).await.unwrap();
        assert!(dispatched);

        let preds = runs_store.fetch_predictions_for_input(
            &runs_store.fetch_due_for_resolution(i64::MAX).unwrap()[0].id,
        ).unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].status, PredictionStatus::Pending);
    }

    #[tokio::test]
    async fn dispatch_backfills_on_demand_when_candles_are_thin() {
        let feed_store = Arc::new(FeedStore::open_in_memory().unwrap());
        let runs_store = Arc::new(RunsStore::open_in_memory().unwrap());
        let runner: Arc<dyn ModelRunnerClient> = Arc::new(MockRunner::always_succeeds());
        let dispatcher = ModelDispatcher::with_provider(
            CrunchContract::default(),
            feed_store.clone(),
            runs_store.clone(),
            runner,
            5,
            Duration::from_secs(1),
            "mock",
            "1m",
            "mock",
        );

        // Feed store starts empty, so `build_raw_input` must backfill before
        // it can hand the model runner a populated candle window.
        let params = PredictionParams::new("BTC", 60, vec![15]);
        let dispatched = dispatcher.dispatch(&params, &BTreeMap::new()).await.unwrap();
        assert!(dispatched);

        let candles = feed_store
            .fetch_records("mock", "BTC", FeedKind::Candle, "1m", 0, Utc::now().timestamp_millis())
            .unwrap();
        assert!(!candles.is_empty(), "on-demand backfill should have populated the feed store");
    }

    #[tokio::test]
    async fn dispatch_marks_timeout_as_failed() {
        let feed_store = Arc::new(FeedStore::open_in_memory().unwrap());
        let runs_store = Arc::new(RunsStore::open_in_memory().unwrap());
        let runner: Arc<dyn ModelRunnerClient> = Arc::new(MockRunner::always_times_out());
        let dispatcher = ModelDispatcher::new(
            CrunchContract::default(),
            feed_store,
            runs_store.clone(),
            runner,
            5,
            Duration::from_millis(10),
            "mock",
            "1m",
        );

        let params = PredictionParams::new("ETH", 60, vec![15]);
        dispatcher.dispatch(&params, &BTreeMap::new()).await.unwrap();

        let input_id = &runs_store.fetch_due_for_resolution(i64::MAX).unwrap()[0].id;
        let preds = runs_store.fetch_predictions_for_input(input_id).unwrap();
        assert_eq!(preds[0].status, PredictionStatus::Failed);
        assert_eq!(preds[0].failed_reason.as_deref(), Some("timeout"));
    }
}
