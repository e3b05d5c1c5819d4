//! SQLite-backed storage for the per-tick pipeline: scheduled configs,
//! inputs, predictions and scores.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;

use crate::model::{
    InputRecord, InputStatus, PredictionParams, PredictionRecord, PredictionScope,
    PredictionStatus, ScheduledPredictionConfig, ScoreRecord,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS prediction_configs (
    id TEXT PRIMARY KEY,
    scope_key TEXT NOT NULL,
    scope_template_json TEXT NOT NULL,
    params_json TEXT NOT NULL,
    every_seconds INTEGER NOT NULL,
    active INTEGER NOT NULL,
    order_hint INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS inputs (
    id TEXT PRIMARY KEY,
    raw_data_json TEXT NOT NULL,
    actuals_json TEXT,
    scope_json TEXT NOT NULL,
    status TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    resolvable_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_inputs_status_resolvable
    ON inputs(status, resolvable_at);

CREATE TABLE IF NOT EXISTS predictions (
    id TEXT PRIMARY KEY,
    input_id TEXT NOT NULL,
    model_id TEXT NOT NULL,
    prediction_config_id TEXT,
    scope_key TEXT NOT NULL,
    scope_json TEXT NOT NULL,
    status TEXT NOT NULL,
    exec_time_ms REAL NOT NULL,
    inference_output_json TEXT,
    failed_reason TEXT,
    performed_at INTEGER NOT NULL,
    resolvable_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_predictions_input
    ON predictions(input_id);
CREATE INDEX IF NOT EXISTS idx_predictions_model_scope
    ON predictions(model_id, scope_key, performed_at DESC);
CREATE INDEX IF NOT EXISTS idx_predictions_status
    ON predictions(status, resolvable_at);

CREATE TABLE IF NOT EXISTS scores (
    id TEXT PRIMARY KEY,
    prediction_id TEXT NOT NULL,
    raw_value REAL,
    final_value REAL,
    success INTEGER NOT NULL,
    failed_reason TEXT,
    scored_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_scores_scored_at
    ON scores(scored_at DESC);
"#;

pub struct RunsStore {
    conn: Arc<Mutex<Connection>>,
}

impl RunsStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    // --- prediction configs ---

    pub fn upsert_config(&self, cfg: &ScheduledPredictionConfig) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO prediction_configs (id, scope_key, scope_template_json, params_json, every_seconds, active, order_hint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                scope_key=excluded.scope_key,
                scope_template_json=excluded.scope_template_json,
                params_json=excluded.params_json,
                every_seconds=excluded.every_seconds,
                active=excluded.active,
                order_hint=excluded.order_hint",
            params![
                cfg.id,
                cfg.scope_key,
                serde_json::to_string(&cfg.scope_template)?,
                serde_json::to_string(&cfg.prediction_params)?,
                cfg.every_seconds,
                cfg.active as i64,
                cfg.order,
            ],
        )?;
        Ok(())
    }

    pub fn fetch_active_configs(&self) -> Result<Vec<ScheduledPredictionConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, scope_key, scope_template_json, params_json, every_seconds, active, order_hint
             FROM prediction_configs WHERE active = 1 ORDER BY order_hint ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let scope_key: String = row.get(1)?;
                let scope_template_json: String = row.get(2)?;
                let params_json: String = row.get(3)?;
                let every_seconds: i64 = row.get(4)?;
                let active: i64 = row.get(5)?;
                let order: i64 = row.get(6)?;
                Ok((id, scope_key, scope_template_json, params_json, every_seconds, active, order))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, scope_key, scope_template_json, params_json, every_seconds, active, order)| {
                let scope_template = serde_json::from_str(&scope_template_json).ok()?;
                let prediction_params: PredictionParams = serde_json::from_str(&params_json).ok()?;
                Some(ScheduledPredictionConfig {
                    id,
                    scope_key,
                    scope_template,
                    prediction_params,
                    every_seconds,
                    active: active != 0,
                    order,
                })
            })
            .collect();
        Ok(rows)
    }

    // --- inputs ---

    pub fn insert_input(&self, input: &InputRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO inputs (id, raw_data_json, actuals_json, scope_json, status, received_at, resolvable_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                input.id,
                serde_json::to_string(&input.raw_data)?,
                input.actuals.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&input.scope)?,
                input.status.as_str(),
                input.received_at.timestamp_millis(),
                input.resolvable_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Inputs still `RECEIVED` whose `resolvable_at` has passed `now`.
    pub fn fetch_due_for_resolution(&self, now_ms: i64) -> Result<Vec<InputRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, raw_data_json, actuals_json, scope_json, status, received_at, resolvable_at
             FROM inputs WHERE status = 'RECEIVED' AND resolvable_at <= ?1
             ORDER BY resolvable_at ASC",
        )?;
        let rows = stmt
            .query_map(params![now_ms], Self::row_to_input)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn mark_input_resolved(&self, input_id: &str, actuals: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE inputs SET status = 'RESOLVED', actuals_json = ?2 WHERE id = ?1",
            params![input_id, serde_json::to_string(actuals)?],
        )?;
        Ok(())
    }

    fn row_to_input(row: &rusqlite::Row) -> rusqlite::Result<InputRecord> {
        let id: String = row.get(0)?;
        let raw_data_json: String = row.get(1)?;
        let actuals_json: Option<String> = row.get(2)?;
        let scope_json: String = row.get(3)?;
        let status: String = row.get(4)?;
        let received_at: i64 = row.get(5)?;
        let resolvable_at: i64 = row.get(6)?;

        Ok(InputRecord {
            id,
            raw_data: serde_json::from_str(&raw_data_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            actuals: actuals_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            scope: serde_json::from_str(&scope_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            status: InputStatus::parse(&status),
            received_at: chrono::DateTime::from_timestamp_millis(received_at).unwrap_or_default(),
            resolvable_at: chrono::DateTime::from_timestamp_millis(resolvable_at).unwrap_or_default(),
        })
    }

    // --- predictions ---

    pub fn insert_predictions(&self, records: &[PredictionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        for p in records {
            conn.execute(
                "INSERT OR IGNORE INTO predictions
                 (id, input_id, model_id, prediction_config_id, scope_key, scope_json, status, exec_time_ms, inference_output_json, failed_reason, performed_at, resolvable_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    p.id,
                    p.input_id,
                    p.model_id,
                    p.prediction_config_id,
                    p.scope_key,
                    serde_json::to_string(&p.scope)?,
                    p.status.as_str(),
                    p.exec_time_ms,
                    p.inference_output.as_ref().map(serde_json::to_string).transpose()?,
                    p.failed_reason,
                    p.performed_at.timestamp_millis(),
                    p.resolvable_at.timestamp_millis(),
                ],
            )?;
        }
        conn.execute("COMMIT", [])?;
        Ok(())
    }

    pub fn fetch_predictions_for_input(&self, input_id: &str) -> Result<Vec<PredictionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, input_id, model_id, prediction_config_id, scope_key, scope_json, status, exec_time_ms, inference_output_json, failed_reason, performed_at, resolvable_at
             FROM predictions WHERE input_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![input_id], Self::row_to_prediction)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn update_prediction_status(
        &self,
        id: &str,
        status: PredictionStatus,
        failed_reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE predictions SET status = ?2, failed_reason = ?3 WHERE id = ?1",
            params![id, status.as_str(), failed_reason],
        )?;
        Ok(())
    }

    /// Predictions in `PENDING` for a given `(model_id, scope_key)`, most recent first.
    pub fn fetch_scored_predictions(
        &self,
        model_id: &str,
        scope_key: &str,
        since_ms: i64,
    ) -> Result<Vec<PredictionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, input_id, model_id, prediction_config_id, scope_key, scope_json, status, exec_time_ms, inference_output_json, failed_reason, performed_at, resolvable_at
             FROM predictions
             WHERE model_id = ?1 AND scope_key = ?2 AND status IN ('SCORED', 'FAILED') AND performed_at >= ?3
             ORDER BY performed_at DESC",
        )?;
        let rows = stmt
            .query_map(params![model_id, scope_key, since_ms], Self::row_to_prediction)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn row_to_prediction(row: &rusqlite::Row) -> rusqlite::Result<PredictionRecord> {
        let id: String = row.get(0)?;
        let input_id: String = row.get(1)?;
        let model_id: String = row.get(2)?;
        let prediction_config_id: Option<String> = row.get(3)?;
        let scope_key: String = row.get(4)?;
        let scope_json: String = row.get(5)?;
        let status: String = row.get(6)?;
        let exec_time_ms: f64 = row.get(7)?;
        let inference_output_json: Option<String> = row.get(8)?;
        let failed_reason: Option<String> = row.get(9)?;
        let performed_at: i64 = row.get(10)?;
        let resolvable_at: i64 = row.get(11)?;

        Ok(PredictionRecord {
            id,
            input_id,
            model_id,
            prediction_config_id,
            scope_key,
            scope: serde_json::from_str::<PredictionScope>(&scope_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            status: PredictionStatus::parse(&status),
            exec_time_ms,
            inference_output: inference_output_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            failed_reason,
            performed_at: chrono::DateTime::from_timestamp_millis(performed_at).unwrap_or_default(),
            resolvable_at: chrono::DateTime::from_timestamp_millis(resolvable_at).unwrap_or_default(),
        })
    }

    // --- scores ---

    pub fn upsert_score(&self, score: &ScoreRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scores (id, prediction_id, raw_value, final_value, success, failed_reason, scored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                raw_value=excluded.raw_value,
                final_value=excluded.final_value,
                success=excluded.success,
                failed_reason=excluded.failed_reason,
                scored_at=excluded.scored_at",
            params![
                score.id,
                score.prediction_id,
                score.raw_value,
                score.final_value,
                score.success as i64,
                score.failed_reason,
                score.scored_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn prune_scores_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM scores WHERE scored_at < ?1
             AND prediction_id IN (SELECT id FROM predictions WHERE status IN ('SCORED', 'FAILED'))",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    pub fn prune_predictions_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM predictions WHERE performed_at < ?1 AND status IN ('SCORED', 'FAILED')",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    /// Latest `performed_at` per `scope_key`, for seeding scheduler LRU state on restart.
    pub fn latest_performed_at_by_scope(&self) -> Result<Vec<(String, chrono::DateTime<chrono::Utc>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT scope_key, MAX(performed_at) FROM predictions GROUP BY scope_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let scope_key: String = row.get(0)?;
                let ts: i64 = row.get(1)?;
                Ok((scope_key, ts))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(scope_key, ts)| {
                chrono::DateTime::from_timestamp_millis(ts).map(|dt| (scope_key, dt))
            })
            .collect();
        Ok(rows)
    }

    // --- scoring-cycle queries ---

    /// `PENDING` predictions whose input has resolved, paired with the input's actuals.
    pub fn fetch_resolvable_predictions(&self) -> Result<Vec<(PredictionRecord, serde_json::Value)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT p.id, p.input_id, p.model_id, p.prediction_config_id, p.scope_key, p.scope_json, p.status,
                    p.exec_time_ms, p.inference_output_json, p.failed_reason, p.performed_at, p.resolvable_at,
                    i.actuals_json
             FROM predictions p
             JOIN inputs i ON i.id = p.input_id
             WHERE p.status = 'PENDING' AND i.status = 'RESOLVED'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let pred = Self::row_to_prediction(row)?;
                let actuals_json: Option<String> = row.get(12)?;
                Ok((pred, actuals_json))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(pred, actuals_json)| {
                let actuals = actuals_json.map(|s| serde_json::from_str(&s)).transpose().ok()?.unwrap_or(serde_json::Value::Null);
                Some((pred, actuals))
            })
            .collect();
        Ok(rows)
    }

    /// Distinct `(model_id, scope_key)` pairs with at least one scored/failed prediction.
    pub fn distinct_model_scopes(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT model_id, scope_key FROM predictions WHERE status IN ('SCORED', 'FAILED')",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Earliest `performed_at` among scored/failed predictions for `(model_id, scope_key)`.
    pub fn first_scored_at(&self, model_id: &str, scope_key: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT MIN(performed_at) FROM predictions
             WHERE model_id = ?1 AND scope_key = ?2 AND status IN ('SCORED', 'FAILED')",
        )?;
        let ts: Option<i64> = stmt.query_row(params![model_id, scope_key], |row| row.get(0))?;
        Ok(ts.and_then(chrono::DateTime::from_timestamp_millis))
    }

    /// Earliest `performed_at` among scored/failed predictions for `model_id` across all scopes.
    pub fn first_scored_at_for_model(&self, model_id: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT MIN(performed_at) FROM predictions WHERE model_id = ?1 AND status IN ('SCORED', 'FAILED')",
        )?;
        let ts: Option<i64> = stmt.query_row(params![model_id], |row| row.get(0))?;
        Ok(ts.and_then(chrono::DateTime::from_timestamp_millis))
    }

    /// Final score values for scored predictions since `since_ms`, optionally scoped to one `scope_key`.
    pub fn fetch_final_scores(&self, model_id: &str, scope_key: Option<&str>, since_ms: i64) -> Result<Vec<f64>> {
        let conn = self.conn.lock();
        let rows: Vec<f64> = match scope_key {
            Some(sk) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT s.final_value FROM scores s
                     JOIN predictions p ON p.id = s.prediction_id
                     WHERE p.model_id = ?1 AND p.scope_key = ?2 AND p.performed_at >= ?3
                       AND s.final_value IS NOT NULL",
                )?;
                let values = stmt
                    .query_map(params![model_id, sk, since_ms], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                values
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT s.final_value FROM scores s
                     JOIN predictions p ON p.id = s.prediction_id
                     WHERE p.model_id = ?1 AND p.performed_at >= ?2
                       AND s.final_value IS NOT NULL",
                )?;
                let values = stmt
                    .query_map(params![model_id, since_ms], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                values
            }
        };
        Ok(rows)
    }
}
