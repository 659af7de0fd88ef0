//! Durable trial store backed by SQLite.
//!
//! Layout: one `trials` row per trial (assignment, failure and metadata as
//! JSON, timestamps as microseconds since the epoch) and a `store_meta`
//! key/value table holding the id high-water mark. Appends bump the mark in
//! the same transaction as the insert, so ids are never reused even when
//! later rows are lost.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tw_types::{
    timestamp_now, EvaluationMetadata, FailureReason, NewTrial, StoreError, Trial, TrialId,
    TrialStatus,
};

use crate::{StoreResult, TrialStore};

const SCHEMA_VERSION: i64 = 1;
const NEXT_ID_KEY: &str = "next_trial_id";

const TRIAL_COLUMNS: &str = "id, origin, status, assignment, score, failure, metadata, \
                             created_at, started_at, ended_at";

#[derive(Debug)]
pub struct SqliteTrialStore {
    conn: Connection,
    path: Option<PathBuf>,
}

fn write_err(e: rusqlite::Error) -> StoreError {
    StoreError::WriteError {
        message: e.to_string(),
    }
}

fn read_err(e: rusqlite::Error) -> StoreError {
    StoreError::ReadError {
        message: e.to_string(),
    }
}

fn encode_err(e: serde_json::Error) -> StoreError {
    StoreError::WriteError {
        message: format!("serialization failed: {e}"),
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(value: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| StoreError::Corruption {
        message: format!("timestamp out of range: {value}"),
    })
}

/// Raw column values, decoded outside the rusqlite row callback so JSON
/// errors surface as corruption rather than query failures.
struct TrialRow {
    id: i64,
    origin: String,
    status: String,
    assignment: String,
    score: Option<f64>,
    failure: Option<String>,
    metadata: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
}

impl TrialRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            origin: row.get(1)?,
            status: row.get(2)?,
            assignment: row.get(3)?,
            score: row.get(4)?,
            failure: row.get(5)?,
            metadata: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            ended_at: row.get(9)?,
        })
    }

    fn into_trial(self) -> StoreResult<Trial> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| StoreError::Corruption {
            message: format!("trial {}: bad {what}: {e}", self.id),
        };

        let status = TrialStatus::parse(&self.status).ok_or_else(|| StoreError::Corruption {
            message: format!("trial {}: unknown status {}", self.id, self.status),
        })?;
        let assignment =
            serde_json::from_str(&self.assignment).map_err(|e| corrupt("assignment", &e))?;
        let failure = self
            .failure
            .as_deref()
            .map(serde_json::from_str::<FailureReason>)
            .transpose()
            .map_err(|e| corrupt("failure", &e))?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<EvaluationMetadata>)
            .transpose()
            .map_err(|e| corrupt("metadata", &e))?;

        Ok(Trial {
            id: self.id as TrialId,
            origin: self.origin,
            assignment,
            status,
            score: self.score,
            failure,
            metadata,
            created_at: from_micros(self.created_at)?,
            started_at: self.started_at.map(from_micros).transpose()?,
            ended_at: self.ended_at.map(from_micros).transpose()?,
        })
    }
}

impl SqliteTrialStore {
    /// Open (or create) a trial database file.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::WriteError {
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(&path).map_err(write_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(write_err)?;

        let store = Self {
            conn,
            path: Some(path),
        };
        store.init_schema()?;
        info!(
            path = %store.path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            next_trial_id = store.next_trial_id()?,
            "opened trial store"
        );
        Ok(store)
    }

    /// Private in-memory database; same semantics, nothing persisted.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(write_err)?;
        let store = Self { conn, path: None };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS trials (
                    id INTEGER PRIMARY KEY,
                    origin TEXT NOT NULL,
                    status TEXT NOT NULL,
                    assignment TEXT NOT NULL,
                    score REAL,
                    failure TEXT,
                    metadata TEXT,
                    created_at INTEGER NOT NULL,
                    started_at INTEGER,
                    ended_at INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_trials_status ON trials(status);

                CREATE TABLE IF NOT EXISTS store_meta (
                    key TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );",
            )
            .map_err(write_err)?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO store_meta (key, value) VALUES (?1, ?2)",
                params![NEXT_ID_KEY, 0i64],
            )
            .map_err(write_err)?;

        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(read_err)?;
        match version {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)",
                        params![SCHEMA_VERSION],
                    )
                    .map_err(write_err)?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                return Err(StoreError::Corruption {
                    message: format!("unsupported schema version {v}, expected {SCHEMA_VERSION}"),
                });
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn load(conn: &Connection, id: TrialId) -> StoreResult<Option<Trial>> {
        let sql = format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE id = ?1");
        conn.query_row(&sql, params![id as i64], TrialRow::from_row)
            .optional()
            .map_err(read_err)?
            .map(TrialRow::into_trial)
            .transpose()
    }

    /// Load, apply a lifecycle transition, and write the row back inside one
    /// transaction.
    fn transition<F>(&mut self, id: TrialId, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Trial) -> StoreResult<()>,
    {
        let tx = self.conn.transaction().map_err(write_err)?;
        let mut trial = Self::load(&tx, id)?.ok_or(StoreError::NotFound { trial_id: id })?;
        apply(&mut trial)?;

        let failure = trial
            .failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(encode_err)?;
        let metadata = trial
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(encode_err)?;

        tx.execute(
            "UPDATE trials
             SET status = ?1, score = ?2, failure = ?3, metadata = ?4,
                 started_at = ?5, ended_at = ?6
             WHERE id = ?7",
            params![
                trial.status.as_str(),
                trial.score,
                failure,
                metadata,
                trial.started_at.map(micros),
                trial.ended_at.map(micros),
                id as i64,
            ],
        )
        .map_err(write_err)?;
        tx.commit().map_err(write_err)?;

        debug!(trial = id, status = trial.status.as_str(), "trial transitioned");
        Ok(())
    }
}

impl TrialStore for SqliteTrialStore {
    fn append(&mut self, trial: NewTrial) -> StoreResult<TrialId> {
        let assignment = serde_json::to_string(&trial.assignment).map_err(encode_err)?;
        let created_at = timestamp_now();

        let tx = self.conn.transaction().map_err(write_err)?;
        let next: i64 = tx
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![NEXT_ID_KEY],
                |row| row.get(0),
            )
            .map_err(write_err)?;
        tx.execute(
            "INSERT INTO trials (id, origin, status, assignment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                next,
                trial.origin,
                TrialStatus::Pending.as_str(),
                assignment,
                micros(created_at),
            ],
        )
        .map_err(write_err)?;
        tx.execute(
            "UPDATE store_meta SET value = ?1 WHERE key = ?2",
            params![next + 1, NEXT_ID_KEY],
        )
        .map_err(write_err)?;
        tx.commit().map_err(write_err)?;

        Ok(next as TrialId)
    }

    fn mark_running(&mut self, id: TrialId) -> StoreResult<()> {
        self.transition(id, |t| t.mark_running(timestamp_now()))
    }

    fn mark_completed(
        &mut self,
        id: TrialId,
        score: f64,
        metadata: EvaluationMetadata,
    ) -> StoreResult<()> {
        self.transition(id, |t| t.mark_completed(score, metadata, timestamp_now()))
    }

    fn mark_failed(&mut self, id: TrialId, reason: FailureReason) -> StoreResult<()> {
        self.transition(id, |t| t.mark_failed(reason, timestamp_now()))
    }

    fn get(&self, id: TrialId) -> StoreResult<Option<Trial>> {
        Self::load(&self.conn, id)
    }

    fn all_trials(&self) -> StoreResult<Vec<Trial>> {
        let sql = format!("SELECT {TRIAL_COLUMNS} FROM trials ORDER BY id");
        let mut stmt = self.conn.prepare(&sql).map_err(read_err)?;
        let rows = stmt
            .query_map([], TrialRow::from_row)
            .map_err(read_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(read_err)?;
        rows.into_iter().map(TrialRow::into_trial).collect()
    }

    fn next_trial_id(&self) -> StoreResult<TrialId> {
        let next: i64 = self
            .conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![NEXT_ID_KEY],
                |row| row.get(0),
            )
            .map_err(read_err)?;
        Ok(next as TrialId)
    }

    fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    fn last_trial_id(&self) -> StoreResult<Option<TrialId>> {
        let last: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM trials", [], |row| row.get(0))
            .map_err(read_err)?;
        Ok(last.map(|id| id as TrialId))
    }

    fn flush(&mut self) -> StoreResult<()> {
        if self.path.is_some() {
            self.conn
                .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
                .map_err(write_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[test]
    fn ids_are_monotonic() {
        conformance::ids_are_monotonic(&mut SqliteTrialStore::open_in_memory().unwrap());
    }

    #[test]
    fn transitions_follow_lifecycle() {
        conformance::transitions_follow_lifecycle(&mut SqliteTrialStore::open_in_memory().unwrap());
    }

    #[test]
    fn failures_are_recorded() {
        conformance::failures_are_recorded(&mut SqliteTrialStore::open_in_memory().unwrap());
    }

    #[test]
    fn reopen_preserves_trials_and_high_water_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("trials.db");

        let written = {
            let mut store = SqliteTrialStore::open(&path).unwrap();
            assert!(store.is_persistent());
            let a = store
                .append(NewTrial::new("random", conformance::assignment(1)))
                .unwrap();
            store.mark_running(a).unwrap();
            store
                .mark_completed(a, 0.5, EvaluationMetadata::default())
                .unwrap();
            store
                .append(NewTrial::new("local", conformance::assignment(2)))
                .unwrap();
            store.flush().unwrap();
            store.all_trials().unwrap()
        };

        let mut reopened = SqliteTrialStore::open(&path).unwrap();
        assert_eq!(reopened.all_trials().unwrap(), written);
        assert_eq!(reopened.next_trial_id().unwrap(), 2);
        let id = reopened
            .append(NewTrial::new("random", conformance::assignment(3)))
            .unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn ids_are_not_reused_after_rows_are_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trials.db");

        {
            let mut store = SqliteTrialStore::open(&path).unwrap();
            for depth in 0..3 {
                store
                    .append(NewTrial::new("random", conformance::assignment(depth)))
                    .unwrap();
            }
            // Simulate a partially written log: the newest row never made it.
            store.conn.execute("DELETE FROM trials WHERE id = 2", []).unwrap();
        }

        let mut reopened = SqliteTrialStore::open(&path).unwrap();
        assert_eq!(reopened.last_trial_id().unwrap(), Some(1));
        let id = reopened
            .append(NewTrial::new("random", conformance::assignment(7)))
            .unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn timestamps_and_scores_round_trip_exactly() {
        let mut store = SqliteTrialStore::open_in_memory().unwrap();
        let id = store
            .append(NewTrial::new("random", conformance::assignment(1)))
            .unwrap();
        store.mark_running(id).unwrap();
        let score = -(0.1f64 * 1000.0 - 3.0).powi(2) / 7.0;
        store
            .mark_completed(id, score, EvaluationMetadata::default())
            .unwrap();

        let trial = store.get(id).unwrap().unwrap();
        assert_eq!(trial.score.unwrap().to_bits(), score.to_bits());
        assert_eq!(trial.assignment, conformance::assignment(1));
    }

    #[test]
    fn corrupted_status_is_reported() {
        let mut store = SqliteTrialStore::open_in_memory().unwrap();
        let id = store
            .append(NewTrial::new("random", conformance::assignment(1)))
            .unwrap();
        store
            .conn
            .execute("UPDATE trials SET status = 'exploded' WHERE id = ?1", params![id as i64])
            .unwrap();
        assert!(matches!(store.get(id), Err(StoreError::Corruption { .. })));
    }
}
