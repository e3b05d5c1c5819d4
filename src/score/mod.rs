//! Scoring engine: settles `PENDING` predictions whose input has resolved,
//! applies percentile-cap normalization per round, and maintains windowed
//! per-model aggregates.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::contract::CrunchContract;
use crate::error::Result;
use crate::model::{
    Model, ModelScore, PredictionRecord, PredictionStatus, RankingInfo, ScopeScoreEntry,
    ScoreRecord, SnapshotRecord,
};
use crate::store::{ModelStore, RunsStore};

pub struct ScoringEngine {
    contract: CrunchContract,
    runs_store: Arc<RunsStore>,
    model_store: Arc<ModelStore>,
    retention_days: i64,
    snapshot_max_age_days: i64,
}

impl ScoringEngine {
    pub fn new(
        contract: CrunchContract,
        runs_store: Arc<RunsStore>,
        model_store: Arc<ModelStore>,
        retention_days: i64,
        snapshot_max_age_days: i64,
    ) -> Self {
        Self {
            contract,
            runs_store,
            model_store,
            retention_days,
            snapshot_max_age_days,
        }
    }

    /// One scoring cycle: score due rounds, refresh windowed aggregates, prune history.
    /// Ground-truth resolution itself is the `GroundTruthResolver`'s job, run beforehand.
    pub fn run_cycle(&self) -> Result<usize> {
        let resolvable = self.runs_store.fetch_resolvable_predictions()?;

        let mut rounds: BTreeMap<(String, i64), Vec<(PredictionRecord, Value)>> = BTreeMap::new();
        for (pred, actuals) in resolvable {
            let key = (pred.scope_key.clone(), pred.performed_at.timestamp_millis());
            rounds.entry(key).or_default().push((pred, actuals));
        }

        let mut scored_total = 0;
        for (_key, members) in rounds {
            scored_total += self.score_round(members)?;
        }

        let models_updated = self.refresh_aggregates()?;
        self.prune()?;

        if scored_total > 0 {
            info!(scored_total, models_updated, "scoring cycle complete");
        }
        Ok(scored_total)
    }

    /// Scores one `(scope_key, performed_at)` round: percentile-cap normalize the
    /// successful raw scores, transition every member to `SCORED`/`FAILED`.
    fn score_round(&self, members: Vec<(PredictionRecord, Value)>) -> Result<usize> {
        struct Judged {
            prediction_id: String,
            success: bool,
            raw: f64,
            failed_reason: Option<String>,
        }

        let judged: Vec<Judged> = members
            .iter()
            .map(|(pred, actuals)| {
                let output = pred.inference_output.as_ref().unwrap_or(&Value::Null);
                let result = (self.contract.scoring_function)(output, actuals);
                Judged {
                    prediction_id: pred.id.clone(),
                    success: result.success,
                    raw: result.value,
                    failed_reason: result.failed_reason,
                }
            })
            .collect();

        let mut raw_sorted: Vec<f64> = judged.iter().filter(|j| j.success).map(|j| j.raw).collect();
        raw_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let bounds = if raw_sorted.is_empty() {
            None
        } else {
            let n = raw_sorted.len();
            let cap_idx = ((0.95 * n as f64).ceil() as usize).saturating_sub(1).min(n - 1);
            let cap = raw_sorted[cap_idx];
            let worst = raw_sorted
                .iter()
                .copied()
                .filter(|&s| s < cap)
                .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |m| m.max(s))))
                .unwrap_or(cap);
            let best = raw_sorted[0];
            Some((worst, best))
        };

        let now = Utc::now();
        for j in &judged {
            let (status, raw_value, final_value) = if j.success {
                let (worst, best) = bounds.expect("at least one success implies bounds");
                let capped = j.raw.min(worst);
                let final_v = if (worst - best).abs() < f64::EPSILON {
                    1.0
                } else {
                    ((worst - capped) / (worst - best)).clamp(0.0, 1.0)
                };
                (PredictionStatus::Scored, Some(j.raw), final_v)
            } else {
                (PredictionStatus::Failed, None, 0.0)
            };

            self.runs_store
                .update_prediction_status(&j.prediction_id, status, j.failed_reason.as_deref())?;
            self.runs_store.upsert_score(&ScoreRecord {
                id: ScoreRecord::for_prediction(&j.prediction_id),
                prediction_id: j.prediction_id.clone(),
                raw_value,
                final_value: Some(final_value),
                success: j.success,
                failed_reason: j.failed_reason.clone(),
                scored_at: now,
            })?;
        }

        Ok(judged.len())
    }

    /// Recomputes windowed metrics for every model with at least one scored prediction.
    fn refresh_aggregates(&self) -> Result<usize> {
        let now = Utc::now();
        let pairs = self.runs_store.distinct_model_scopes()?;

        let mut by_model: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (model_id, scope_key) in pairs {
            by_model.entry(model_id).or_default().push(scope_key);
        }

        for (model_id, scope_keys) in &by_model {
            let mut scores_by_scope = Vec::with_capacity(scope_keys.len());
            for scope_key in scope_keys {
                let first = self.runs_store.first_scored_at(model_id, scope_key)?;
                let metrics = self.window_metrics(model_id, Some(scope_key), first, now)?;
                scores_by_scope.push(ScopeScoreEntry {
                    scope_key: scope_key.clone(),
                    scope: Value::Null,
                    metrics,
                });
            }

            let first_overall = self.runs_store.first_scored_at_for_model(model_id)?;
            let metrics = self.window_metrics(model_id, None, first_overall, now)?;
            let ranking_value = metrics.get(&self.contract.aggregation.ranking_key).copied().flatten();
            let overall_score = ModelScore {
                metrics: metrics.clone(),
                ranking: Some(RankingInfo {
                    key: self.contract.aggregation.ranking_key.clone(),
                    value: ranking_value,
                    direction: self.contract.aggregation.ranking_direction,
                }),
                payload: Value::Null,
            };

            let mut model = self
                .model_store
                .fetch_model(model_id)?
                .unwrap_or_else(|| Model::new(model_id, model_id, "", "", ""));
            model.overall_score = Some(overall_score);
            model.scores_by_scope = scores_by_scope;
            model.updated_at = now;
            self.model_store.upsert_model(&model)?;

            let snapshot_metrics: BTreeMap<String, f64> =
                metrics.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect();
            self.model_store.insert_snapshot(&SnapshotRecord {
                id: format!("SNAP_{model_id}_{}", now.format("%Y%m%d_%H%M%S%.3f")),
                model_id: model_id.clone(),
                period_start: now - chrono::Duration::hours(24),
                period_end: now,
                metrics: snapshot_metrics,
                created_at: now,
            })?;
        }

        Ok(by_model.len())
    }

    /// Per-window arithmetic mean of `final_value`, `None` until the model's
    /// earliest scored prediction for this scope predates the window.
    fn window_metrics(
        &self,
        model_id: &str,
        scope_key: Option<&str>,
        first_scored: Option<chrono::DateTime<Utc>>,
        now: chrono::DateTime<Utc>,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        let mut metrics = BTreeMap::new();
        for (window_name, window) in &self.contract.aggregation.windows {
            let mature = first_scored
                .map(|first| now - first >= chrono::Duration::hours(window.hours))
                .unwrap_or(false);

            let value = if mature {
                let since = (now - chrono::Duration::hours(window.hours)).timestamp_millis();
                let values = self.runs_store.fetch_final_scores(model_id, scope_key, since)?;
                if values.is_empty() {
                    None
                } else {
                    Some(values.iter().sum::<f64>() / values.len() as f64)
                }
            } else {
                None
            };

            metrics.insert(window_name.clone(), value);
        }
        Ok(metrics)
    }

    fn prune(&self) -> Result<()> {
        let now = Utc::now();
        let score_cutoff = (now - chrono::Duration::days(self.retention_days)).timestamp_millis();
        let snapshot_cutoff = (now - chrono::Duration::days(self.snapshot_max_age_days)).timestamp_millis();

        match self.runs_store.prune_scores_before(score_cutoff) {
            Ok(n) if n > 0 => info!(deleted = n, "pruned old scores"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to prune scores"),
        }
        match self.runs_store.prune_predictions_before(score_cutoff) {
            Ok(n) if n > 0 => info!(deleted = n, "pruned old predictions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to prune predictions"),
        }
        match self.model_store.prune_snapshots_before(snapshot_cutoff) {
            Ok(n) if n > 0 => info!(deleted = n, "pruned old snapshots"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to prune snapshots"),
        }
        Ok(())
    }
}
