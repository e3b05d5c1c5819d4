//! End-to-end integration test over `GroundTruthResolver` -> `ScoringEngine`
//! -> `LeaderboardBuilder`, wired together through shared in-memory sqlite
//! stores rather than each module's own isolated fixtures.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use coordinator_core::contract::CrunchContract;
use coordinator_core::leaderboard::LeaderboardBuilder;
use coordinator_core::model::{
    FeedKind, FeedRecord, InputRecord, PredictionRecord, PredictionScope, PredictionStatus,
};
use coordinator_core::resolve::GroundTruthResolver;
use coordinator_core::score::ScoringEngine;
use coordinator_core::store::{FeedStore, ModelStore, RunsStore};

fn candle(subject: &str, ts: chrono::DateTime<Utc>, close: f64) -> FeedRecord {
    let mut values = BTreeMap::new();
    values.insert("close".to_string(), serde_json::json!(close));
    FeedRecord::new("test", subject, FeedKind::Candle, "1m", ts, values, BTreeMap::new())
}

fn pending(model_id: &str, input_id: &str, scope: &PredictionScope, performed_at: chrono::DateTime<Utc>, resolvable_at: chrono::DateTime<Utc>, p_up: f64) -> PredictionRecord {
    PredictionRecord {
        id: PredictionRecord::generate_id(PredictionStatus::Pending, model_id, &scope.scope_key(), performed_at),
        input_id: input_id.to_string(),
        model_id: model_id.to_string(),
        prediction_config_id: None,
        scope_key: scope.scope_key(),
        scope: scope.clone(),
        status: PredictionStatus::Pending,
        exec_time_ms: 12.0,
        inference_output: Some(serde_json::json!({"p_up": p_up})),
        failed_reason: None,
        performed_at,
        resolvable_at,
    }
}

#[test]
fn resolve_then_score_then_rank_round_trips_through_sqlite() {
    let feed_store = Arc::new(FeedStore::open_in_memory().unwrap());
    let runs_store = Arc::new(RunsStore::open_in_memory().unwrap());
    let model_store = Arc::new(ModelStore::open_in_memory().unwrap());

    // One resolved round, two hours ago, for a scope whose horizon has
    // already elapsed: the entry candle and the resolved candle bracket a
    // price rise, so the default resolver reports `direction_up = true`.
    let performed_at = Utc::now() - Duration::hours(2);
    let horizon = Duration::seconds(300);
    let resolvable_at = performed_at + horizon;

    feed_store.append_records(&[
        candle("BTC", performed_at, 100.0),
        candle("BTC", resolvable_at, 105.0),
    ]).unwrap();

    let scope = PredictionScope {
        subject: "BTC".to_string(),
        horizon_seconds: 300,
        step_seconds: 60,
        extra: BTreeMap::new(),
    };
    let input = InputRecord::new(serde_json::json!({}), scope.clone(), performed_at, 300);
    runs_store.insert_input(&input).unwrap();

    // Three models: a confident-correct, a neutral, and a confident-wrong.
    let records = vec![
        pending("m-high", &input.id, &scope, performed_at, resolvable_at, 0.9),
        pending("m-mid", &input.id, &scope, performed_at, resolvable_at, 0.5),
        pending("m-low", &input.id, &scope, performed_at, resolvable_at, 0.1),
    ];
    runs_store.insert_predictions(&records).unwrap();

    let contract = CrunchContract::default();

    let resolver = GroundTruthResolver::new(
        contract.clone(), feed_store.clone(), runs_store.clone(), "test", "1m", 24,
    );
    let resolved = resolver.run_cycle().unwrap();
    assert_eq!(resolved, 1, "the one overdue input should resolve");

    let scoring = ScoringEngine::new(contract.clone(), runs_store.clone(), model_store.clone(), 30, 30);
    let scored = scoring.run_cycle().unwrap();
    assert_eq!(scored, 3, "all three predictions for the resolved input should score");

    let scope_key = scope.scope_key();
    let final_score = |model_id: &str| -> f64 {
        let preds = runs_store.fetch_scored_predictions(model_id, &scope_key, 0).unwrap();
        assert_eq!(preds[0].status, PredictionStatus::Scored);
        runs_store.fetch_final_scores(model_id, Some(scope_key.as_str()), 0).unwrap()[0]
    };

    // Brier loss (lower raw = better) ranks m-high best, the ties for worst
    // (m-mid, m-low) both land at the percentile cap.
    assert!((final_score("m-high") - 1.0).abs() < 1e-9);
    assert!((final_score("m-mid") - 0.0).abs() < 1e-9);
    assert!((final_score("m-low") - 0.0).abs() < 1e-9);
    for model_id in ["m-high", "m-mid", "m-low"] {
        let v = final_score(model_id);
        assert!((0.0..=1.0).contains(&v));
    }

    let leaderboard = LeaderboardBuilder::new(contract, model_store);
    let board = leaderboard.build_leaderboard().unwrap();
    assert_eq!(board.entries.len(), 3);

    let checkpoint = leaderboard.build_emission(&board).unwrap();
    let rewards = &checkpoint.emission.cruncher_rewards;
    assert_eq!(rewards.len(), 3);
    assert!(rewards.iter().all(|r| r.reward_pct >= 0));
    assert_eq!(rewards.iter().map(|r| r.reward_pct).sum::<i64>(), 1_000_000_000);
}

#[test]
fn rerunning_resolve_and_score_cycles_is_idempotent() {
    let feed_store = Arc::new(FeedStore::open_in_memory().unwrap());
    let runs_store = Arc::new(RunsStore::open_in_memory().unwrap());
    let model_store = Arc::new(ModelStore::open_in_memory().unwrap());

    let performed_at = Utc::now() - Duration::hours(2);
    let horizon = Duration::seconds(60);
    let resolvable_at = performed_at + horizon;

    feed_store.append_records(&[
        candle("ETH", performed_at, 50.0),
        candle("ETH", resolvable_at, 48.0),
    ]).unwrap();

    let scope = PredictionScope {
        subject: "ETH".to_string(),
        horizon_seconds: 60,
        step_seconds: 15,
        extra: BTreeMap::new(),
    };
    let input = InputRecord::new(serde_json::json!({}), scope.clone(), performed_at, 60);
    runs_store.insert_input(&input).unwrap();
    runs_store
        .insert_predictions(&[pending("m1", &input.id, &scope, performed_at, resolvable_at, 0.7)])
        .unwrap();

    let contract = CrunchContract::default();
    let resolver = GroundTruthResolver::new(contract.clone(), feed_store, runs_store.clone(), "test", "1m", 24);
    let scoring = ScoringEngine::new(contract, runs_store.clone(), model_store, 30, 30);

    assert_eq!(resolver.run_cycle().unwrap(), 1);
    assert_eq!(scoring.run_cycle().unwrap(), 1);

    // A scored prediction's input is no longer RECEIVED and the prediction
    // itself is no longer PENDING, so a second cycle finds nothing left to
    // transition -- status never regresses from SCORED/FAILED.
    assert_eq!(resolver.run_cycle().unwrap(), 0);
    assert_eq!(scoring.run_cycle().unwrap(), 0);

    let scope_key = scope.scope_key();
    let preds = runs_store.fetch_scored_predictions("m1", &scope_key, 0).unwrap();
    assert_eq!(preds[0].status, PredictionStatus::Scored);
}
