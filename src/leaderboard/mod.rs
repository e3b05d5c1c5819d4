//! Ranking and emission: builds a `Leaderboard` snapshot from every model's
//! `overall_score`, then converts dense ranks into a `frac64` reward vector.

use chrono::Utc;
use tracing::info;

use crate::contract::CrunchContract;
use crate::error::Result;
use crate::model::{
    CheckpointRecord, CheckpointStatus, CruncherReward, EmissionCheckpoint, Leaderboard,
    LeaderboardEntry, ProviderReward, RankingDirection,
};
use crate::store::ModelStore;

const FRAC_64_MULTIPLIER: i64 = 1_000_000_000;

/// rank -> reward percentage (of 100). Ranks past the last tier get 0.
const TIERS: &[(u32, u32, f64)] = &[(1, 1, 35.0), (2, 5, 10.0), (6, 10, 5.0)];

pub struct LeaderboardBuilder {
    contract: CrunchContract,
    model_store: std::sync::Arc<ModelStore>,
}

impl LeaderboardBuilder {
    pub fn new(contract: CrunchContract, model_store: std::sync::Arc<ModelStore>) -> Self {
        Self { contract, model_store }
    }

    /// Ranks all models, persists the leaderboard snapshot, and returns it.
    pub fn build_leaderboard(&self) -> Result<Leaderboard> {
        let mut models = self.model_store.fetch_all_models()?;
        models.retain(|m| m.overall_score.is_some());

        let ranking_key = &self.contract.aggregation.ranking_key;
        let direction = self.contract.aggregation.ranking_direction;

        models.sort_by(|a, b| {
            let va = ranking_value(a, ranking_key);
            let vb = ranking_value(b, ranking_key);
            match (va, vb) {
                (Some(x), Some(y)) => {
                    let ord = x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal);
                    match direction {
                        RankingDirection::Desc => ord.reverse(),
                        RankingDirection::Asc => ord,
                    }
                }
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| a.id.cmp(&b.id))
        });

        let mut entries = Vec::with_capacity(models.len());
        let mut rank = 0u32;
        let mut prev_value: Option<Option<f64>> = None;
        for (idx, model) in models.iter().enumerate() {
            let value = ranking_value(model, ranking_key);
            if idx == 0 {
                rank = 1;
            } else if prev_value != Some(value) {
                rank += 1;
            }
            prev_value = Some(value);
            entries.push(LeaderboardEntry {
                rank,
                model_id: model.id.clone(),
                model_name: model.name.clone(),
                player_name: model.player_name.clone(),
                score: model.overall_score.clone().expect("filtered to Some above"),
            });
        }

        let now = Utc::now();
        let board = Leaderboard {
            id: format!("LB_{}", now.format("%Y%m%d_%H%M%S%.3f")),
            created_at: now,
            entries,
            generated_by: "coordinator".to_string(),
        };
        self.model_store.insert_leaderboard(&board)?;
        info!(entries = board.entries.len(), "leaderboard rebuilt");
        Ok(board)
    }

    /// Converts a leaderboard into an emission checkpoint and persists it `PENDING`.
    pub fn build_emission(&self, board: &Leaderboard) -> Result<CheckpointRecord> {
        let n = board.entries.len();
        let mut pct_by_rank: Vec<f64> = board.entries.iter().map(|e| tier_pct(e.rank)).collect();

        if n > 0 {
            let claimed: f64 = pct_by_rank.iter().sum();
            let remainder = (100.0 - claimed).max(0.0);
            if remainder > 0.0 {
                let share = remainder / n as f64;
                for pct in &mut pct_by_rank {
                    *pct += share;
                }
            }
        }

        let mut frac64: Vec<i64> = pct_by_rank
            .iter()
            .map(|pct| ((pct / 100.0) * FRAC_64_MULTIPLIER as f64).round() as i64)
            .collect();

        if !frac64.is_empty() {
            let sum_rest: i64 = frac64.iter().skip(1).sum();
            frac64[0] = FRAC_64_MULTIPLIER - sum_rest;
        }

        let cruncher_rewards: Vec<CruncherReward> = board
            .entries
            .iter()
            .zip(frac64.iter())
            .enumerate()
            .map(|(idx, (_entry, &reward_pct))| CruncherReward { cruncher_index: idx as u32, reward_pct })
            .collect();

        let compute_provider_rewards = self
            .contract
            .compute_provider
            .as_ref()
            .map(|p| vec![ProviderReward { provider: p.clone(), reward_pct: FRAC_64_MULTIPLIER }])
            .unwrap_or_default();
        let data_provider_rewards = self
            .contract
            .data_provider
            .as_ref()
            .map(|p| vec![ProviderReward { provider: p.clone(), reward_pct: FRAC_64_MULTIPLIER }])
            .unwrap_or_default();

        let now = Utc::now();
        let checkpoint = CheckpointRecord {
            id: format!("CKPT_{}", now.format("%Y%m%d_%H%M%S%.3f")),
            created_at: now,
            status: CheckpointStatus::Pending,
            emission: EmissionCheckpoint {
                crunch_pubkey: self.contract.crunch_pubkey.clone(),
                cruncher_rewards,
                compute_provider_rewards,
                data_provider_rewards,
            },
        };
        self.model_store.insert_checkpoint(&checkpoint)?;
        Ok(checkpoint)
    }
}

fn ranking_value(model: &crate::model::Model, ranking_key: &str) -> Option<f64> {
    model.overall_score.as_ref()?.metrics.get(ranking_key).copied().flatten()
}

fn tier_pct(rank: u32) -> f64 {
    TIERS
        .iter()
        .find(|(lo, hi, _)| rank >= *lo && rank <= *hi)
        .map(|(_, _, pct)| *pct)
        .unwrap_or(0.0)
}
