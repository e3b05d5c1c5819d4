use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Frozen `(asset, horizon, steps)` identity used by the scheduler and as the
/// prediction lane key. Value-equal tuples are deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredictionParams {
    pub asset: String,
    pub horizon: i64,
    pub steps: Vec<i64>,
}

impl PredictionParams {
    pub fn new(asset: impl Into<String>, horizon: i64, steps: Vec<i64>) -> Self {
        Self {
            asset: asset.into(),
            horizon,
            steps,
        }
    }

    /// Grouping key shared by configs scheduled together: `(horizon, steps, every_seconds)`.
    pub fn group_key(&self, every_seconds: i64) -> (i64, Vec<i64>, i64) {
        (self.horizon, self.steps.clone(), every_seconds)
    }

    pub fn label(&self) -> String {
        format!(
            "{} • {}s • steps: {}",
            self.asset,
            self.horizon,
            self.steps
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PredictionStatus {
    Pending,
    Scored,
    Failed,
    Absent,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Pending => "PENDING",
            PredictionStatus::Scored => "SCORED",
            PredictionStatus::Failed => "FAILED",
            PredictionStatus::Absent => "ABSENT",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SCORED" => PredictionStatus::Scored,
            "FAILED" => PredictionStatus::Failed,
            "ABSENT" => PredictionStatus::Absent,
            _ => PredictionStatus::Pending,
        }
    }
}

/// A scheduled prediction configuration, grouped for round-robin scheduling by
/// `(horizon, steps, every_seconds)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPredictionConfig {
    pub id: String,
    pub scope_key: String,
    pub scope_template: BTreeMap<String, Value>,
    pub prediction_params: PredictionParams,
    pub every_seconds: i64,
    pub active: bool,
    pub order: i64,
}

/// `(full scope descriptor)`: subject/horizon/step plus any contract extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionScope {
    pub subject: String,
    pub horizon_seconds: i64,
    pub step_seconds: i64,
    pub extra: BTreeMap<String, Value>,
}

impl PredictionScope {
    /// Stable string projection used for indexing (`scope_key`).
    pub fn scope_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.subject, self.horizon_seconds, self.step_seconds
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub input_id: String,
    pub model_id: String,
    pub prediction_config_id: Option<String>,
    pub scope_key: String,
    pub scope: PredictionScope,
    pub status: PredictionStatus,
    pub exec_time_ms: f64,
    pub inference_output: Option<Value>,
    pub failed_reason: Option<String>,
    pub performed_at: DateTime<Utc>,
    pub resolvable_at: DateTime<Utc>,
}

impl PredictionRecord {
    /// `id = f(status, model_id, scope_key, performed_at)`.
    pub fn generate_id(status: PredictionStatus, model_id: &str, scope_key: &str, performed_at: DateTime<Utc>) -> String {
        let prefix = if status == PredictionStatus::Absent {
            "ABS"
        } else {
            "PRE"
        };
        let safe_scope: String = scope_key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!(
            "{prefix}_{model_id}_{safe_scope}_{}",
            performed_at.format("%Y%m%d_%H%M%S%.3f")
        )
    }
}
