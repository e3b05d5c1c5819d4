use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of invoking the scoring function on one prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    pub value: f64,
    pub success: bool,
    pub failed_reason: Option<String>,
}

impl Default for ScoreResult {
    fn default() -> Self {
        Self {
            value: 0.0,
            success: true,
            failed_reason: None,
        }
    }
}

/// Persisted per-prediction score. `value` may be null on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: String,
    pub prediction_id: String,
    pub raw_value: Option<f64>,
    pub final_value: Option<f64>,
    pub success: bool,
    pub failed_reason: Option<String>,
    pub scored_at: DateTime<Utc>,
}

impl ScoreRecord {
    pub fn for_prediction(prediction_id: &str) -> String {
        format!("SCR_{prediction_id}")
    }
}
