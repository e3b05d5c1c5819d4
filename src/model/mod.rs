pub mod feed;
pub mod input;
pub mod leaderboard;
pub mod prediction;
pub mod score;

pub use feed::{FeedKind, FeedRecord, FeedScope, IngestionWatermark};
pub use input::{GroundTruth, InputRecord, InputStatus};
pub use leaderboard::{
    CheckpointRecord, CheckpointStatus, CruncherReward, EmissionCheckpoint, Leaderboard,
    LeaderboardEntry, Model, ModelScore, ProviderReward, RankingDirection, RankingInfo,
    ScopeScoreEntry, SnapshotRecord,
};
pub use prediction::{
    PredictionParams, PredictionRecord, PredictionScope, PredictionStatus,
    ScheduledPredictionConfig,
};
pub use score::{ScoreRecord, ScoreResult};
