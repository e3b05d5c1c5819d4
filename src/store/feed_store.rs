//! SQLite-backed feed cache keyed by content hash for idempotent upsert.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::model::{FeedKind, FeedRecord, FeedScope, IngestionWatermark};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS feed_records (
    natural_key TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    subject TEXT NOT NULL,
    kind TEXT NOT NULL,
    granularity TEXT NOT NULL,
    ts_event INTEGER NOT NULL,
    values_json TEXT NOT NULL,
    meta_json TEXT NOT NULL,
    ts_ingested INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_feed_records_scope_ts
    ON feed_records(source, subject, kind, granularity, ts_event DESC);

CREATE TABLE IF NOT EXISTS feed_watermarks (
    scope_key TEXT PRIMARY KEY,
    last_ts_event INTEGER NOT NULL,
    phase TEXT NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Content hash used as the natural key: idempotent on re-ingestion of the
/// same bar/tick across restarts and overlapping backfill windows.
fn natural_key(record: &FeedRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.source.as_bytes());
    hasher.update(record.subject.as_bytes());
    hasher.update(record.kind.as_str().as_bytes());
    hasher.update(record.granularity.as_bytes());
    hasher.update(record.ts_event.timestamp_millis().to_be_bytes());
    hex::encode(hasher.finalize())
}

pub struct FeedStore {
    conn: Arc<Mutex<Connection>>,
}

impl FeedStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize feed store schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM feed_records", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, existing = count, "feed store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert records not already present by natural key. Returns the count
    /// actually inserted (duplicates are silently skipped).
    pub fn append_records(&self, records: &[FeedRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let mut inserted = 0usize;
        for record in records {
            let key = natural_key(record);
            let values_json = serde_json::to_string(&record.values)?;
            let meta_json = serde_json::to_string(&record.meta)?;

            let changes = conn.execute(
                "INSERT OR IGNORE INTO feed_records
                 (natural_key, source, subject, kind, granularity, ts_event, values_json, meta_json, ts_ingested)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    key,
                    record.source,
                    record.subject,
                    record.kind.as_str(),
                    record.granularity,
                    record.ts_event.timestamp_millis(),
                    values_json,
                    meta_json,
                    record.ts_ingested.timestamp_millis(),
                ],
            )?;
            inserted += changes;
        }

        conn.execute("COMMIT", [])?;
        Ok(inserted)
    }

    pub fn fetch_records(
        &self,
        source: &str,
        subject: &str,
        kind: FeedKind,
        granularity: &str,
        from_ts_ms: i64,
        to_ts_ms: i64,
    ) -> Result<Vec<FeedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, subject, kind, granularity, ts_event, values_json, meta_json, ts_ingested
             FROM feed_records
             WHERE source = ?1 AND subject = ?2 AND kind = ?3 AND granularity = ?4
               AND ts_event >= ?5 AND ts_event <= ?6
             ORDER BY ts_event ASC",
        )?;

        let rows = stmt
            .query_map(
                params![source, subject, kind.as_str(), granularity, from_ts_ms, to_ts_ms],
                Self::row_to_record,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn fetch_latest_record(
        &self,
        source: &str,
        subject: &str,
        kind: FeedKind,
        granularity: &str,
    ) -> Result<Option<FeedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, subject, kind, granularity, ts_event, values_json, meta_json, ts_ingested
             FROM feed_records
             WHERE source = ?1 AND subject = ?2 AND kind = ?3 AND granularity = ?4
             ORDER BY ts_event DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![source, subject, kind.as_str(), granularity])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_record(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn prune_before(&self, cutoff_ts_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM feed_records WHERE ts_event < ?1", params![cutoff_ts_ms])?;
        if deleted > 0 {
            warn!(deleted, cutoff_ts_ms, "pruned stale feed records");
        }
        Ok(deleted)
    }

    pub fn get_watermark(&self, scope: &FeedScope, scope_key: &str) -> Result<Option<IngestionWatermark>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT last_ts_event, phase FROM feed_watermarks WHERE scope_key = ?1")?;
        let mut rows = stmt.query(params![scope_key])?;
        if let Some(row) = rows.next()? {
            let last_ts_event: i64 = row.get(0)?;
            let phase: String = row.get(1)?;
            let ts = chrono::DateTime::from_timestamp_millis(last_ts_event).unwrap_or_default();
            Ok(Some(IngestionWatermark::new(scope.clone(), ts, &phase)))
        } else {
            Ok(None)
        }
    }

    pub fn set_watermark(&self, scope_key: &str, last_ts_event_ms: i64, phase: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO feed_watermarks (scope_key, last_ts_event, phase, updated_at)
             VALUES (?1, ?2, ?3, strftime('%s','now'))
             ON CONFLICT(scope_key) DO UPDATE SET
                last_ts_event = excluded.last_ts_event,
                phase = excluded.phase,
                updated_at = excluded.updated_at",
            params![scope_key, last_ts_event_ms, phase],
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<FeedRecord> {
        let source: String = row.get(0)?;
        let subject: String = row.get(1)?;
        let kind_str: String = row.get(2)?;
        let granularity: String = row.get(3)?;
        let ts_event_ms: i64 = row.get(4)?;
        let values_json: String = row.get(5)?;
        let meta_json: String = row.get(6)?;
        let ts_ingested_ms: i64 = row.get(7)?;

        let kind = FeedKind::parse(&kind_str);
        let values = serde_json::from_str(&values_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let meta = serde_json::from_str(&meta_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        Ok(FeedRecord {
            source,
            subject,
            kind,
            granularity,
            ts_event: chrono::DateTime::from_timestamp_millis(ts_event_ms).unwrap_or_default(),
            values,
            meta,
            ts_ingested: chrono::DateTime::from_timestamp_millis(ts_ingested_ms).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(subject: &str, price: f64, ts: chrono::DateTime<Utc>) -> FeedRecord {
        let mut values = BTreeMap::new();
        values.insert("close".to_string(), serde_json::json!(price));
        FeedRecord::new("test", subject, FeedKind::Candle, "1m", ts, values, BTreeMap::new())
    }

    #[test]
    fn append_is_idempotent_on_natural_key() {
        let store = FeedStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        let r = record("BTC", 100.0, t0);
        assert_eq!(store.append_records(&[r.clone()]).unwrap(), 1);
        assert_eq!(store.append_records(&[r]).unwrap(), 0);
    }

    #[test]
    fn fetch_records_orders_ascending_by_ts() {
        let store = FeedStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        let recs = vec![
            record("BTC", 101.0, t0 + chrono::Duration::seconds(60)),
            record("BTC", 100.0, t0),
        ];
        store.append_records(&recs).unwrap();

        let fetched = store
            .fetch_records("test", "BTC", FeedKind::Candle, "1m", 0, i64::MAX)
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(fetched[0].ts_event < fetched[1].ts_event);
    }

    #[test]
    fn watermark_round_trips() {
        let store = FeedStore::open_in_memory().unwrap();
        let scope = FeedScope::new("test", "BTC", FeedKind::Candle, "1m");
        store.set_watermark("test:BTC:candle:1m", 1_000, "listen").unwrap();
        let wm = store.get_watermark(&scope, "test:BTC:candle:1m").unwrap().unwrap();
        assert_eq!(wm.last_event_ts.unwrap().timestamp_millis(), 1_000);
    }

    #[test]
    fn prune_before_removes_only_stale_rows() {
        let store = FeedStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        store
            .append_records(&[
                record("BTC", 100.0, t0 - chrono::Duration::days(10)),
                record("BTC", 101.0, t0),
            ])
            .unwrap();

        let deleted = store.prune_before((t0 - chrono::Duration::days(1)).timestamp_millis()).unwrap();
        assert_eq!(deleted, 1);
        let remaining = store
            .fetch_records("test", "BTC", FeedKind::Candle, "1m", 0, i64::MAX)
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
