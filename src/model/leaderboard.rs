use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Which direction is better for a ranking key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingInfo {
    pub key: String,
    pub value: Option<f64>,
    pub direction: RankingDirection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelScore {
    /// Window name (e.g. "score_recent") → mean final score, `None` until mature.
    pub metrics: BTreeMap<String, Option<f64>>,
    pub ranking: Option<RankingInfo>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeScoreEntry {
    pub scope_key: String,
    pub scope: Value,
    pub metrics: BTreeMap<String, Option<f64>>,
}

/// A participant model, created on first discovery and updated every
/// aggregation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub player_id: String,
    pub player_name: String,
    pub deployment_identifier: String,
    pub overall_score: Option<ModelScore>,
    pub scores_by_scope: Vec<ScopeScoreEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        player_id: impl Into<String>,
        player_name: impl Into<String>,
        deployment_identifier: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            player_id: player_id.into(),
            player_name: player_name.into(),
            deployment_identifier: deployment_identifier.into(),
            overall_score: None,
            scores_by_scope: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub model_id: String,
    pub model_name: String,
    pub player_name: String,
    pub score: ModelScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<LeaderboardEntry>,
    pub generated_by: String,
}

/// A rolling per-model metric snapshot, kept for historical reporting and
/// pruned by age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub model_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckpointStatus {
    Pending,
    Submitted,
    Failed,
}

/// On-chain reward percentage for one cruncher, in frac64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CruncherReward {
    pub cruncher_index: u32,
    pub reward_pct: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReward {
    pub provider: String,
    pub reward_pct: i64,
}

/// The emission artifact handed to the (out-of-scope) on-chain submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionCheckpoint {
    pub crunch_pubkey: String,
    pub cruncher_rewards: Vec<CruncherReward>,
    pub compute_provider_rewards: Vec<ProviderReward>,
    pub data_provider_rewards: Vec<ProviderReward>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: CheckpointStatus,
    pub emission: EmissionCheckpoint,
}
