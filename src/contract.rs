//! Typed envelopes and pluggable callables for one prediction challenge.
//!
//! Python's `CrunchContract` bundles Pydantic model classes plus free
//! functions on a single config object. The idiomatic substitute here is a
//! struct of boxed closures: each component takes only the capability it
//! needs as a constructor argument, rather than the whole contract.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{FeedRecord, RankingDirection};

#[derive(Debug, Clone, Copy)]
pub struct AggregationWindow {
    pub hours: i64,
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub windows: BTreeMap<String, AggregationWindow>,
    pub ranking_key: String,
    pub ranking_direction: RankingDirection,
}

impl Default for Aggregation {
    fn default() -> Self {
        let mut windows = BTreeMap::new();
        windows.insert("score_recent".to_string(), AggregationWindow { hours: 24 });
        windows.insert("score_steady".to_string(), AggregationWindow { hours: 72 });
        windows.insert("score_anchor".to_string(), AggregationWindow { hours: 168 });
        Self {
            windows,
            ranking_key: "score_recent".to_string(),
            ranking_direction: RankingDirection::Desc,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionScopeDefaults {
    pub subject: String,
    pub horizon_seconds: i64,
    pub step_seconds: i64,
}

impl Default for PredictionScopeDefaults {
    fn default() -> Self {
        Self {
            subject: "BTC".to_string(),
            horizon_seconds: 60,
            step_seconds: 15,
        }
    }
}

pub type ResolveGroundTruthFn = Arc<dyn Fn(&[FeedRecord]) -> Option<Value> + Send + Sync>;
pub type ScoringFn = Arc<dyn Fn(&Value, &Value) -> crate::model::ScoreResult + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Single source of truth for one challenge's data shapes and aggregation.
#[derive(Clone)]
pub struct CrunchContract {
    pub scope_defaults: PredictionScopeDefaults,
    pub aggregation: Aggregation,
    pub crunch_pubkey: String,
    pub compute_provider: Option<String>,
    pub data_provider: Option<String>,
    pub resolve_ground_truth: ResolveGroundTruthFn,
    pub scoring_function: ScoringFn,
    pub transform: Option<TransformFn>,
}

impl Default for CrunchContract {
    fn default() -> Self {
        Self {
            scope_defaults: PredictionScopeDefaults::default(),
            aggregation: Aggregation::default(),
            crunch_pubkey: String::new(),
            compute_provider: None,
            data_provider: None,
            resolve_ground_truth: Arc::new(default_resolve_ground_truth),
            scoring_function: Arc::new(default_score_brier_probability_up),
            transform: None,
        }
    }
}

/// Default resolver: compare first and last record's close/price in the window.
pub fn default_resolve_ground_truth(feed_records: &[FeedRecord]) -> Option<Value> {
    if feed_records.is_empty() {
        return None;
    }
    let entry_price = feed_records.first()?.price()?;
    let resolved_price = feed_records.last()?.price()?;

    Some(serde_json::json!({
        "entry_price": entry_price,
        "resolved_price": resolved_price,
        "return": (resolved_price - entry_price) / entry_price.abs().max(1e-9),
        "direction_up": resolved_price > entry_price,
    }))
}

/// Default scoring function: Brier loss on a `p_up` probability prediction
/// against the default resolver's `direction_up` ground truth. Lower raw is
/// better, matching the percentile-cap normalization convention.
pub fn default_score_brier_probability_up(
    inference_output: &Value,
    ground_truth: &Value,
) -> crate::model::ScoreResult {
    let p_up = inference_output.get("p_up").and_then(Value::as_f64);
    let direction_up = ground_truth.get("direction_up").and_then(Value::as_bool);

    match (p_up, direction_up) {
        (Some(p_up), Some(direction_up)) if (0.0..=1.0).contains(&p_up) => {
            let y = if direction_up { 1.0 } else { 0.0 };
            crate::model::ScoreResult {
                value: (p_up - y).powi(2),
                success: true,
                failed_reason: None,
            }
        }
        (Some(p_up), _) if !(0.0..=1.0).contains(&p_up) => crate::model::ScoreResult {
            value: 0.0,
            success: false,
            failed_reason: Some(format!("p_up out of [0,1]: {p_up}")),
        },
        _ => crate::model::ScoreResult {
            value: 0.0,
            success: false,
            failed_reason: Some("missing p_up or direction_up".to_string()),
        },
    }
}
