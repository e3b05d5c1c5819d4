use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::prediction::PredictionScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputStatus {
    Received,
    Resolved,
}

impl InputStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputStatus::Received => "RECEIVED",
            InputStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "RESOLVED" => InputStatus::Resolved,
            _ => InputStatus::Received,
        }
    }
}

/// One input snapshot handed to all models at `received_at`, later resolved
/// against ground truth once `resolvable_at` has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: String,
    pub raw_data: Value,
    pub actuals: Option<Value>,
    pub scope: PredictionScope,
    pub status: InputStatus,
    pub received_at: DateTime<Utc>,
    pub resolvable_at: DateTime<Utc>,
}

impl InputRecord {
    pub fn new(raw_data: Value, scope: PredictionScope, received_at: DateTime<Utc>, horizon_seconds: i64) -> Self {
        Self {
            id: format!("INP_{}", received_at.format("%Y%m%d_%H%M%S%.3f")),
            raw_data,
            actuals: None,
            scope,
            status: InputStatus::Received,
            received_at,
            resolvable_at: received_at + chrono::Duration::seconds(horizon_seconds),
        }
    }
}

/// Default ground-truth shape produced by `default_resolve_ground_truth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruth {
    pub entry_price: f64,
    pub resolved_price: f64,
    #[serde(rename = "return")]
    pub return_pct: f64,
    pub direction_up: bool,
}
