//! Property tests for the quantified invariants: percentile-cap scoring
//! bounds, emission-vector conservation, feed-store idempotence/round-trip,
//! watermark monotonicity, and round-robin scheduling fairness.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use coordinator_core::contract::CrunchContract;
use coordinator_core::leaderboard::LeaderboardBuilder;
use coordinator_core::model::{
    FeedKind, FeedRecord, FeedScope, InputRecord, Model, ModelScore, PredictionParams,
    PredictionRecord, PredictionScope, PredictionStatus, RankingDirection, RankingInfo,
};
use coordinator_core::scheduler::GroupScheduler;
use coordinator_core::score::ScoringEngine;
use coordinator_core::store::{FeedStore, ModelStore, RunsStore};
use proptest::prelude::*;

const FRAC_64_MULTIPLIER: i64 = 1_000_000_000;

fn at(mins_from_epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(mins_from_epoch * 60, 0).unwrap()
}

fn candle(subject: &str, ts: DateTime<Utc>, close: f64) -> FeedRecord {
    let mut values = BTreeMap::new();
    values.insert("close".to_string(), serde_json::json!(close));
    FeedRecord::new("test", subject, FeedKind::Candle, "1m", ts, values, BTreeMap::new())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Roundtrip: `record -> row -> record` preserves the natural-key fields
    /// plus `values`/`meta`.
    #[test]
    fn feed_record_roundtrip_preserves_fields(
        subject in "[A-Z]{2,6}",
        close in (-100_000i32..100_000).prop_map(|c| c as f64 / 100.0),
        minute_offset in 0i64..100_000,
    ) {
        let store = FeedStore::open_in_memory().unwrap();
        let ts = at(minute_offset);
        let record = candle(&subject, ts, close);
        store.append_records(std::slice::from_ref(&record)).unwrap();

        let fetched = store
            .fetch_latest_record("test", &subject, FeedKind::Candle, "1m")
            .unwrap()
            .expect("just-inserted record should be retrievable");

        prop_assert_eq!(fetched.source, record.source);
        prop_assert_eq!(fetched.subject, record.subject);
        prop_assert_eq!(fetched.kind, record.kind);
        prop_assert_eq!(fetched.granularity, record.granularity);
        prop_assert_eq!(fetched.ts_event, record.ts_event);
        prop_assert_eq!(fetched.values, record.values);
        prop_assert_eq!(fetched.meta, record.meta);
    }

    /// Idempotence: appending the same batch twice yields the same contents.
    #[test]
    fn append_records_is_idempotent(
        subject in "[A-Z]{2,6}",
        closes in prop::collection::vec(-1_000.0f64..1_000.0, 1..20),
    ) {
        let store = FeedStore::open_in_memory().unwrap();
        let records: Vec<FeedRecord> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| candle(&subject, at(i as i64), close))
            .collect();

        store.append_records(&records).unwrap();
        let from = at(0).timestamp_millis();
        let to = at(records.len() as i64).timestamp_millis();
        let first_pass = store.fetch_records("test", &subject, FeedKind::Candle, "1m", from, to).unwrap();

        store.append_records(&records).unwrap();
        let second_pass = store.fetch_records("test", &subject, FeedKind::Candle, "1m", from, to).unwrap();

        prop_assert_eq!(first_pass.len(), second_pass.len());
        prop_assert_eq!(first_pass.len(), records.len());
        for (a, b) in first_pass.iter().zip(second_pass.iter()) {
            prop_assert_eq!(a.ts_event, b.ts_event);
            prop_assert_eq!(&a.values, &b.values);
        }
    }

    /// Monotonicity: after a sequence of non-decreasing `set_watermark` calls
    /// (the only order the ingestor ever drives it in), the stored watermark
    /// always equals the latest value written, never an earlier one.
    #[test]
    fn watermark_last_event_ts_is_monotonic(
        deltas in prop::collection::vec(0i64..500, 1..20),
    ) {
        let store = FeedStore::open_in_memory().unwrap();
        let scope = FeedScope::new("test", "BTC", FeedKind::Candle, "1m");

        let mut ts_ms = 0i64;
        let mut last_written = i64::MIN;
        for delta in deltas {
            ts_ms += delta * 1000;
            store.set_watermark("test:BTC:candle:1m", ts_ms, "backfill").unwrap();
            prop_assert!(ts_ms >= last_written);
            last_written = ts_ms;

            let wm = store.get_watermark(&scope, "test:BTC:candle:1m").unwrap().unwrap();
            prop_assert_eq!(wm.last_event_ts.unwrap().timestamp_millis(), last_written);
        }
    }

    /// For all prediction rounds: every `final_i` is in `[0, 1]`.
    #[test]
    fn scored_predictions_final_value_is_bounded(
        raws in prop::collection::vec(0.0f64..10_000.0, 1..30),
    ) {
        let runs = Arc::new(RunsStore::open_in_memory().unwrap());
        let models = Arc::new(ModelStore::open_in_memory().unwrap());

        let scope = PredictionScope {
            subject: "BTC".to_string(),
            horizon_seconds: 60,
            step_seconds: 15,
            extra: BTreeMap::new(),
        };
        let performed_at = Utc::now() - chrono::Duration::seconds(120);
        let input = InputRecord::new(serde_json::json!({}), scope.clone(), performed_at, 60);
        runs.insert_input(&input).unwrap();
        runs.mark_input_resolved(&input.id, &serde_json::json!({})).unwrap();

        let records: Vec<PredictionRecord> = raws
            .iter()
            .enumerate()
            .map(|(i, &raw)| {
                let model_id = format!("m{i}");
                PredictionRecord {
                    id: PredictionRecord::generate_id(PredictionStatus::Pending, &model_id, &scope.scope_key(), performed_at),
                    input_id: input.id.clone(),
                    model_id,
                    prediction_config_id: None,
                    scope_key: scope.scope_key(),
                    scope: scope.clone(),
                    status: PredictionStatus::Pending,
                    exec_time_ms: 1.0,
                    inference_output: Some(serde_json::json!({"raw": raw})),
                    failed_reason: None,
                    performed_at,
                    resolvable_at: performed_at + chrono::Duration::seconds(60),
                }
            })
            .collect();
        runs.insert_predictions(&records).unwrap();

        let contract = CrunchContract {
            scoring_function: Arc::new(|output, _actuals| {
                let raw = output.get("raw").and_then(serde_json::Value::as_f64).unwrap();
                coordinator_core::model::ScoreResult { value: raw, success: true, failed_reason: None }
            }),
            ..CrunchContract::default()
        };

        let engine = ScoringEngine::new(contract, runs.clone(), models, 30, 30);
        let scored = engine.run_cycle().unwrap();
        prop_assert_eq!(scored, records.len());

        let scope_key = scope.scope_key();
        for record in &records {
            let finals = runs.fetch_final_scores(&record.model_id, Some(scope_key.as_str()), 0).unwrap();
            prop_assert_eq!(finals.len(), 1);
            prop_assert!(finals[0] >= 0.0 && finals[0] <= 1.0);
        }
    }

    /// For all emissions: the reward vector sums to exactly `FRAC_64_MULTIPLIER`
    /// and every individual share is non-negative.
    #[test]
    fn emission_vector_conserves_frac64_total(
        scores in prop::collection::vec(0.0f64..1.0, 1..30),
    ) {
        let store = Arc::new(ModelStore::open_in_memory().unwrap());
        for (i, &score) in scores.iter().enumerate() {
            let model_id = format!("m{i}");
            let mut model = Model::new(&model_id, &model_id, "p", "Player", "deploy");
            let mut metrics = BTreeMap::new();
            metrics.insert("score_recent".to_string(), Some(score));
            model.overall_score = Some(ModelScore {
                metrics,
                ranking: Some(RankingInfo {
                    key: "score_recent".to_string(),
                    value: Some(score),
                    direction: RankingDirection::Desc,
                }),
                payload: serde_json::Value::Null,
            });
            store.upsert_model(&model).unwrap();
        }

        let builder = LeaderboardBuilder::new(CrunchContract::default(), store);
        let board = builder.build_leaderboard().unwrap();
        let checkpoint = builder.build_emission(&board).unwrap();
        let rewards = checkpoint.emission.cruncher_rewards;

        prop_assert_eq!(rewards.len(), scores.len());
        prop_assert!(rewards.iter().all(|r| r.reward_pct >= 0));
        prop_assert_eq!(rewards.iter().map(|r| r.reward_pct).sum::<i64>(), FRAC_64_MULTIPLIER);
    }

    /// For a group with `n` assets scheduled at a shared interval, over any
    /// time horizon much longer than the interval, per-asset emission count
    /// differs by at most 1.
    #[test]
    fn round_robin_emission_count_differs_by_at_most_one(
        asset_count in 2usize..6,
        rounds in 20u32..80,
    ) {
        let assets: Vec<String> = (0..asset_count).map(|i| format!("A{i}")).collect();
        let mut sched = GroupScheduler::new(86_400, vec![300], 3_600.0, assets.clone());

        let mut counts: BTreeMap<String, u32> = assets.iter().cloned().map(|a| (a, 0)).collect();
        let mut now = at(0);
        let step = chrono::Duration::seconds(60);

        for _ in 0..(rounds * asset_count as u32) {
            if let Some(PredictionParams { asset, .. }) = sched.next(now, Some(now)) {
                *counts.get_mut(&asset).unwrap() += 1;
                sched.mark_executed(&asset, now);
            }
            now += step;
        }

        let min = *counts.values().min().unwrap();
        let max = *counts.values().max().unwrap();
        prop_assert!(max - min <= 1, "counts: {:?}", counts);
    }
}
