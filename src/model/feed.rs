use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single timestamped market observation from a feed provider.
///
/// Natural key is `(source, subject, kind, granularity, ts_event)`; repeated
/// ingestion of the same key updates `values`/`meta`/`ts_ingested` in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRecord {
    pub source: String,
    pub subject: String,
    pub kind: FeedKind,
    pub granularity: String,
    pub ts_event: DateTime<Utc>,
    pub values: BTreeMap<String, Value>,
    pub meta: BTreeMap<String, Value>,
    pub ts_ingested: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Tick,
    Candle,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Tick => "tick",
            FeedKind::Candle => "candle",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "candle" => FeedKind::Candle,
            _ => FeedKind::Tick,
        }
    }
}

impl FeedRecord {
    pub fn new(
        source: impl Into<String>,
        subject: impl Into<String>,
        kind: FeedKind,
        granularity: impl Into<String>,
        ts_event: DateTime<Utc>,
        values: BTreeMap<String, Value>,
        meta: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            source: source.into(),
            subject: subject.into(),
            kind,
            granularity: granularity.into(),
            ts_event,
            values,
            meta,
            ts_ingested: Utc::now(),
        }
    }

    /// Best-effort close/price extraction, used by the default ground-truth resolver.
    pub fn price(&self) -> Option<f64> {
        for key in ["close", "price"] {
            if let Some(v) = self.values.get(key).and_then(Value::as_f64) {
                return Some(v);
            }
        }
        None
    }
}

/// The scope a feed record stream belongs to: `(source, subject, kind, granularity)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedScope {
    pub source: String,
    pub subject: String,
    pub kind: FeedKind,
    pub granularity: String,
}

impl FeedScope {
    pub fn new(
        source: impl Into<String>,
        subject: impl Into<String>,
        kind: FeedKind,
        granularity: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            subject: subject.into(),
            kind,
            granularity: granularity.into(),
        }
    }
}

/// Watermark: the highest `ts_event` durably ingested for a `FeedScope`.
///
/// Monotonic non-decreasing; advanced only after the batch referencing its
/// max `ts_event` has been appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionWatermark {
    pub scope: FeedScope,
    pub last_event_ts: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub meta: BTreeMap<String, Value>,
}

impl IngestionWatermark {
    pub fn new(scope: FeedScope, last_event_ts: DateTime<Utc>, phase: &str) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("phase".to_string(), Value::String(phase.to_string()));
        Self {
            scope,
            last_event_ts: Some(last_event_ts),
            updated_at: Utc::now(),
            meta,
        }
    }
}
