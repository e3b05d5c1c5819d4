//! Ground-truth resolver: settles `RECEIVED` inputs once their resolvable
//! window has closed, using the contract-supplied resolver callable.

use chrono::Utc;
use tracing::{info, warn};

use crate::contract::CrunchContract;
use crate::error::Result;
use crate::model::FeedKind;
use crate::store::{FeedStore, RunsStore};

pub struct GroundTruthResolver {
    contract: CrunchContract,
    feed_store: std::sync::Arc<FeedStore>,
    runs_store: std::sync::Arc<RunsStore>,
    source: String,
    granularity: String,
    max_retry: chrono::Duration,
}

impl GroundTruthResolver {
    pub fn new(
        contract: CrunchContract,
        feed_store: std::sync::Arc<FeedStore>,
        runs_store: std::sync::Arc<RunsStore>,
        source: impl Into<String>,
        granularity: impl Into<String>,
        max_retry_hours: i64,
    ) -> Self {
        Self {
            contract,
            feed_store,
            runs_store,
            source: source.into(),
            granularity: granularity.into(),
            max_retry: chrono::Duration::hours(max_retry_hours),
        }
    }

    /// One resolution cycle. Returns the number of inputs transitioned.
    pub fn run_cycle(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.runs_store.fetch_due_for_resolution(now.timestamp_millis())?;
        let mut resolved = 0;

        for input in due {
            let records = self.feed_store.fetch_records(
                &self.source,
                &input.scope.subject,
                FeedKind::Candle,
                &self.granularity,
                input.received_at.timestamp_millis(),
                input.resolvable_at.timestamp_millis(),
            )?;

            match (self.contract.resolve_ground_truth)(&records) {
                Some(actuals) => {
                    self.runs_store.mark_input_resolved(&input.id, &actuals)?;
                    resolved += 1;
                }
                None => {
                    let age = now - input.resolvable_at;
                    if age >= self.max_retry {
                        warn!(input_id = %input.id, "resolver retry budget exhausted, resolving as null");
                        self.runs_store.mark_input_resolved(&input.id, &serde_json::Value::Null)?;
                        resolved += 1;
                    }
                }
            }
        }

        if resolved > 0 {
            info!(resolved, "resolver cycle settled inputs");
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedKind as FK, FeedRecord, InputRecord, PredictionScope};
    use std::collections::BTreeMap;

    fn scope() -> PredictionScope {
        PredictionScope {
            subject: "BTC".to_string(),
            horizon_seconds: 60,
            step_seconds: 15,
            extra: BTreeMap::new(),
        }
    }

    fn candle(price: f64, ts: chrono::DateTime<Utc>) -> FeedRecord {
        let mut values = BTreeMap::new();
        values.insert("close".to_string(), serde_json::json!(price));
        FeedRecord::new("mock", "BTC", FK::Candle, "1m", ts, values, BTreeMap::new())
    }

    #[test]
    fn resolves_input_when_window_has_data() {
        let feed_store = std::sync::Arc::new(FeedStore::open_in_memory().unwrap());
        let runs_store = std::sync::Arc::new(RunsStore::open_in_memory().unwrap());

        let t0 = Utc::now() - chrono::Duration::seconds(120);
        feed_store.append_records(&[candle(100.0, t0), candle(105.0, t0 + chrono::Duration::seconds(60))]).unwrap();

        let input = InputRecord::new(serde_json::json!({}), scope(), t0, 60);
        runs_store.insert_input(&input).unwrap();

        let resolver = GroundTruthResolver::new(CrunchContract::default(), feed_store, runs_store.clone(), "mock", "1m", 24);
        let resolved = resolver.run_cycle().unwrap();
        assert_eq!(resolved, 1);

        let due = runs_store.fetch_due_for_resolution(i64::MAX).unwrap();
        assert!(due.is_empty());
    }

    #[test]
    fn leaves_input_received_until_retry_budget_exhausted() {
        let feed_store = std::sync::Arc::new(FeedStore::open_in_memory().unwrap());
        let runs_store = std::sync::Arc::new(RunsStore::open_in_memory().unwrap());

        let t0 = Utc::now() - chrono::Duration::seconds(120);
        let input = InputRecord::new(serde_json::json!({}), scope(), t0, 60);
        runs_store.insert_input(&input).unwrap();

        let resolver = GroundTruthResolver::new(CrunchContract::default(), feed_store, runs_store.clone(), "mock", "1m", 24);
        let resolved = resolver.run_cycle().unwrap();
        assert_eq!(resolved, 0);

        let still_due = runs_store.fetch_due_for_resolution(i64::MAX).unwrap();
        assert_eq!(still_due.len(), 1);
    }
}
