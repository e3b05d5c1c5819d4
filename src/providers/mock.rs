//! Deterministic in-memory provider for tests: a sine-ish walk seeded from
//! the subject string, no network dependency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::{FeedKind, FeedRecord};
use crate::notify::Notifier;

use super::MarketProvider;

pub struct MockProvider {
    subject: String,
    granularity: String,
    step_seconds: i64,
    base_price: f64,
    ticks_emitted: Mutex<u64>,
}

impl MockProvider {
    pub fn new(subject: impl Into<String>, granularity: impl Into<String>) -> Self {
        let subject = subject.into();
        let base_price = 100.0 + subject.bytes().map(|b| b as f64).sum::<f64>() % 50.0;
        Self {
            subject,
            granularity: granularity.into(),
            step_seconds: 60,
            base_price,
            ticks_emitted: Mutex::new(0),
        }
    }

    fn price_at(&self, ts_event: DateTime<Utc>) -> f64 {
        let phase = (ts_event.timestamp() / self.step_seconds) as f64;
        self.base_price + phase.sin() * 2.0
    }

    fn record_at(&self, ts_event: DateTime<Utc>) -> FeedRecord {
        let mut values = BTreeMap::new();
        values.insert("close".to_string(), serde_json::json!(self.price_at(ts_event)));
        FeedRecord {
            source: "mock".to_string(),
            subject: self.subject.clone(),
            kind: FeedKind::Candle,
            granularity: self.granularity.clone(),
            ts_event,
            values,
            meta: BTreeMap::new(),
            ts_ingested: Utc::now(),
        }
    }
}

#[async_trait]
impl MarketProvider for MockProvider {
    async fn fetch(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<FeedRecord>> {
        let mut out = Vec::new();
        let mut cursor = from;
        while cursor <= to {
            out.push(self.record_at(cursor));
            cursor += chrono::Duration::seconds(self.step_seconds);
        }
        Ok(out)
    }

    async fn listen(
        &self,
        on_record: tokio::sync::mpsc::Sender<FeedRecord>,
        notifier: Notifier,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(200));
        loop {
            ticker.tick().await;
            let record = self.record_at(Utc::now());
            *self.ticks_emitted.lock() += 1;
            if on_record.send(record).await.is_err() {
                return Ok(());
            }
            notifier.notify();
        }
    }
}
