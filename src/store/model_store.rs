//! SQLite-backed storage for models, leaderboards, snapshots and emission checkpoints.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;

use crate::model::{CheckpointRecord, CheckpointStatus, Leaderboard, Model, SnapshotRecord};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS models (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    player_id TEXT NOT NULL,
    player_name TEXT NOT NULL,
    deployment_identifier TEXT NOT NULL,
    overall_score_json TEXT,
    scores_by_scope_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS leaderboards (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    entries_json TEXT NOT NULL,
    generated_by TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_leaderboards_created_at
    ON leaderboards(created_at DESC);

CREATE TABLE IF NOT EXISTS snapshots (
    id TEXT PRIMARY KEY,
    model_id TEXT NOT NULL,
    period_start INTEGER NOT NULL,
    period_end INTEGER NOT NULL,
    metrics_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snapshots_model_created
    ON snapshots(model_id, created_at DESC);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    emission_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_checkpoints_created_at
    ON checkpoints(created_at DESC);
"#;

pub struct ModelStore {
    conn: Arc<Mutex<Connection>>,
}

impl ModelStore {
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

    pub fn upsert_model(&self, model: &Model) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO models (id, name, player_id, player_name, deployment_identifier, overall_score_json, scores_by_scope_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                player_id=excluded.player_id,
                player_name=excluded.player_name,
                deployment_identifier=excluded.deployment_identifier,
                overall_score_json=excluded.overall_score_json,
                scores_by_scope_json=excluded.scores_by_scope_json,
                updated_at=excluded.updated_at",
            params![
                model.id,
                model.name,
                model.player_id,
                model.player_name,
                model.deployment_identifier,
                model.overall_score.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&model.scores_by_scope)?,
                model.created_at.timestamp_millis(),
                model.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn fetch_model(&self, id: &str) -> Result<Option<Model>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, player_id, player_name, deployment_identifier, overall_score_json, scores_by_scope_json, created_at, updated_at
             FROM models WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_model(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn fetch_all_models(&self) -> Result<Vec<Model>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, player_id, player_name, deployment_identifier, overall_score_json, scores_by_scope_json, created_at, updated_at
             FROM models",
        )?;
        let rows = stmt.query_map([], Self::row_to_model)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    fn row_to_model(row: &rusqlite::Row) -> rusqlite::Result<Model> {
        let id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let player_id: String = row.get(2)?;
        let player_name: String = row.get(3)?;
        let deployment_identifier: String = row.get(4)?;
        let overall_score_json: Option<String> = row.get(5)?;
        let scores_by_scope_json: String = row.get(6)?;
        let created_at: i64 = row.get(7)?;
        let updated_at: i64 = row.get(8)?;

        Ok(Model {
            id,
            name,
            player_id,
            player_name,
            deployment_identifier,
            overall_score: overall_score_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            scores_by_scope: serde_json::from_str(&scores_by_scope_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            created_at: chrono::DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
            updated_at: chrono::DateTime::from_timestamp_millis(updated_at).unwrap_or_default(),
        })
    }

    pub fn insert_leaderboard(&self, board: &Leaderboard) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO leaderboards (id, created_at, entries_json, generated_by) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET entries_json=excluded.entries_json",
            params![
                board.id,
                board.created_at.timestamp_millis(),
                serde_json::to_string(&board.entries)?,
                board.generated_by,
            ],
        )?;
        Ok(())
    }

    pub fn fetch_latest_leaderboard(&self) -> Result<Option<Leaderboard>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, created_at, entries_json, generated_by FROM leaderboards ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let created_at: i64 = row.get(1)?;
            let entries_json: String = row.get(2)?;
            let generated_by: String = row.get(3)?;
            Ok(Some(Leaderboard {
                id,
                created_at: chrono::DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
                entries: serde_json::from_str(&entries_json)?,
                generated_by,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn insert_snapshot(&self, snap: &SnapshotRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO snapshots (id, model_id, period_start, period_end, metrics_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snap.id,
                snap.model_id,
                snap.period_start.timestamp_millis(),
                snap.period_end.timestamp_millis(),
                serde_json::to_string(&snap.metrics)?,
                snap.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn prune_snapshots_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM snapshots WHERE created_at < ?1", params![cutoff_ms])?;
        Ok(deleted)
    }

    pub fn insert_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO checkpoints (id, created_at, status, emission_json) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET status=excluded.status, emission_json=excluded.emission_json",
            params![
                checkpoint.id,
                checkpoint.created_at.timestamp_millis(),
                status_str(checkpoint.status),
                serde_json::to_string(&checkpoint.emission)?,
            ],
        )?;
        Ok(())
    }

    pub fn update_checkpoint_status(&self, id: &str, status: CheckpointStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE checkpoints SET status = ?2 WHERE id = ?1",
            params![id, status_str(status)],
        )?;
        Ok(())
    }

    pub fn fetch_pending_checkpoints(&self) -> Result<Vec<CheckpointRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, created_at, status, emission_json FROM checkpoints WHERE status = 'PENDING' ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let created_at: i64 = row.get(1)?;
                let status: String = row.get(2)?;
                let emission_json: String = row.get(3)?;
                Ok((id, created_at, status, emission_json))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, created_at, status, emission_json)| {
                Some(CheckpointRecord {
                    id,
                    created_at: chrono::DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
                    status: parse_status(&status),
                    emission: serde_json::from_str(&emission_json).ok()?,
                })
            })
            .collect();
        Ok(rows)
    }
}

fn status_str(status: CheckpointStatus) -> &'static str {
    match status {
        CheckpointStatus::Pending => "PENDING",
        CheckpointStatus::Submitted => "SUBMITTED",
        CheckpointStatus::Failed => "FAILED",
    }
}

fn parse_status(s: &str) -> CheckpointStatus {
    match s {
        "SUBMITTED" => CheckpointStatus::Submitted,
        "FAILED" => CheckpointStatus::Failed,
        _ => CheckpointStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EmissionCheckpoint;

    #[test]
    fn model_round_trips() {
        let store = ModelStore::open_in_memory().unwrap();
        let model = Model::new("m1", "Model One", "p1", "Player One", "deploy-1");
        store.upsert_model(&model).unwrap();
        let fetched = store.fetch_model("m1").unwrap().unwrap();
        assert_eq!(fetched.name, "Model One");
    }

    #[test]
    fn checkpoint_round_trips_and_transitions() {
        let store = ModelStore::open_in_memory().unwrap();
        let checkpoint = CheckpointRecord {
            id: "CKPT_1".to_string(),
            created_at: chrono::Utc::now(),
            status: CheckpointStatus::Pending,
            emission: EmissionCheckpoint {
                crunch_pubkey: "pubkey".to_string(),
                cruncher_rewards: vec![],
                compute_provider_rewards: vec![],
                data_provider_rewards: vec![],
            },
        };
        store.insert_checkpoint(&checkpoint).unwrap();
        assert_eq!(store.fetch_pending_checkpoints().unwrap().len(), 1);

        store.update_checkpoint_status("CKPT_1", CheckpointStatus::Submitted).unwrap();
        assert_eq!(store.fetch_pending_checkpoints().unwrap().len(), 0);
    }
}
